use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use vdenet::{
    host::{NetlinkLinks, SwitchClient},
    server,
    store::JsonFileStore,
    Config, Driver,
};

fn main() {
    let config = Config::parse();

    env_logger::Builder::new()
        .filter_level(config.log_level())
        .parse_default_env()
        .init();

    let links = match NetlinkLinks::new() {
        Ok(links) => links,
        Err(e) => {
            error!("Failed to set up netlink: {:?}", e);
            exit(-1);
        }
    };

    let store = JsonFileStore::new(config.store_path());
    info!("Using data store {}", store.path().display());

    // Built outside the daemon runtime: the netlink adapter owns its own.
    let driver = Arc::new(Driver::new(
        Arc::new(store),
        Arc::new(links),
        switch_client(&config),
        config.clean,
    ));

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {:?}", e);
            exit(-1);
        }
    };

    if let Err(e) = runtime.block_on(server::run_daemon(&config.socket, driver.clone())) {
        error!("Daemon failed: {:?}", e);
        exit(-1);
    }
    drop(runtime);

    info!("Daemon is exiting");
}

#[cfg(not(feature = "libvdeplug"))]
fn switch_client(config: &Config) -> Arc<dyn SwitchClient> {
    Arc::new(vdenet::host::VdePlugProcess::new(&config.vde_plug))
}

#[cfg(feature = "libvdeplug")]
fn switch_client(_config: &Config) -> Arc<dyn SwitchClient> {
    Arc::new(vdenet::host::LibVdePlug)
}
