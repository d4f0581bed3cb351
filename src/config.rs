use std::path::PathBuf;

use clap::Parser;

/// File name of the data store inside `--dir-path`.
pub const STORE_FILE: &str = "vde_plug_docker.json";

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "vdenet")]
#[command(about = "vdenet is a Docker network driver plugging containers into VDE switches.")]
pub struct Config {
    /// Verbose logging.
    #[arg(long)]
    pub debug: bool,

    /// Wipe the persisted state instead of restoring it.
    #[arg(long)]
    pub clean: bool,

    /// Directory of the data store.
    #[arg(long, default_value = "/etc/docker")]
    pub dir_path: PathBuf,

    /// Unix socket the plugin API is served on.
    #[arg(long, default_value = "/run/docker/plugins/vde.sock")]
    pub socket: PathBuf,

    /// Helper used to plug devices into switches.
    #[arg(long, default_value = "vde_plug")]
    pub vde_plug: PathBuf,
}

impl Config {
    pub fn store_path(&self) -> PathBuf {
        self.dir_path.join(STORE_FILE)
    }

    pub fn log_level(&self) -> log::LevelFilter {
        if self.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        }
    }
}
