use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;

/// Durable home of the driver snapshot. The blob is opaque here.
#[cfg_attr(test, mockall::automock)]
pub trait Store: Send + Sync {
    /// Last saved blob, or `None` when nothing was saved yet.
    fn load(&self) -> anyhow::Result<Option<Vec<u8>>>;

    fn save(&self, blob: &[u8]) -> anyhow::Result<()>;

    fn clear(&self) -> anyhow::Result<()>;
}

/// Snapshot kept in a single file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    /// Serialises writers sharing this store.
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Store for JsonFileStore {
    fn load(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        match std::fs::read(&self.path) {
            Ok(contents) if contents.is_empty() => Ok(None),
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    fn save(&self, blob: &[u8]) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent_dir) = self.path.parent() {
            std::fs::create_dir_all(parent_dir)?;
        }

        let tmp_path = self.tmp_path();
        std::fs::write(&tmp_path, blob)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .with_context(|| format!("Failed to clear {}", self.path.display()))?;

        Ok(())
    }
}
