use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use directories_next::ProjectDirs;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use serde_json;
use fd_lock::{RwLock, RwLockWriteGuard};
use std::fs::OpenOptions;
use std::str;
use log::info;

use crate::config::types::Config;
use crate::error::ConfigError;

// creates a path to pressensor.json in an os dependent standard directory, such as %AppData% on
// windows.
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "pressensor", "pressensor-ble").map(|dirs| {
        dirs.config_dir().join("pressensor.json")
    })
}

pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    /// Exclusive lock on the config file. Held for the lifetime of a session so that one device is
    /// never driven by two processes.
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<std::fs::File>, ConfigError> {
        match self.rw_lock.try_write() {
            Ok(guard) => Ok(guard),
            Err(source) => Err(ConfigError::CanNotLock { source }),
        }
    }
}

struct ConfigIOInner {
    file: std::fs::File,
}

#[derive(Clone)]
pub struct ConfigIO {
    inner: Arc<Mutex<ConfigIOInner>>,
}

impl ConfigIO {
    /// Open (creating if needed) the config file at `path`, or at the per-user default location.
    pub fn new_sync(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => get_local_config_path().ok_or(ConfigError::NoConfigPath)?,
        };
        info!("Using config file {}", path.to_string_lossy());

        if let Some(directory) = path.parent() {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .append(false)
            .create(true)
            .open(path)?;

        let inner = ConfigIOInner {
            file,
        };
        Ok(ConfigIO { inner: Arc::new(Mutex::new(inner)) })
    }

    pub fn locker(&self) -> Result<ConfigIOLocker, ConfigError> {
        let file = self.clone_file()?;

        Ok(ConfigIOLocker {
            rw_lock: RwLock::new(file),
        })
    }

    fn clone_file(&self) -> Result<std::fs::File, ConfigError> {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(inner.file.try_clone()?)
    }

    // every handle is a dup of the same descriptor, so they share the file offset
    fn get_file(&self) -> Result<File, ConfigError> {
        Ok(File::from_std(self.clone_file()?)) // tokio File
    }

    pub async fn read(&self) -> Result<Config, ConfigError> {
        let mut file = self.get_file()?;

        let mut content = vec![];
        file.rewind().await?;
        file.read_to_end(&mut content).await?;

        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Config::default());
        }

        let content = str::from_utf8(&content)?;
        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let mut file = self.get_file()?;
        info!("Saving config");

        let content = serde_json::to_string_pretty(config)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let config_io = ConfigIO::new_sync(Some(&dir.path().join("pressensor.json"))).unwrap();

        assert_eq!(config_io.read().await.unwrap(), Config::default());
    }

    #[tokio::test]
    async fn save_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pressensor.json");
        let config_io = ConfigIO::new_sync(Some(&path)).unwrap();

        let config = Config {
            address: Some("AA:BB:CC:DD:EE:FF".to_string()),
            name: Some("PRS12345".to_string()),
            connection_enabled: false,
        };
        config_io.save(&config).await.unwrap();
        assert_eq!(config_io.read().await.unwrap(), config);

        // a shorter config must not leave trailing bytes behind
        let shorter = Config::default();
        config_io.save(&shorter).await.unwrap();
        assert_eq!(config_io.read().await.unwrap(), shorter);
    }

    #[tokio::test]
    async fn invalid_json_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pressensor.json");
        std::fs::write(&path, "{not json").unwrap();

        let config_io = ConfigIO::new_sync(Some(&path)).unwrap();
        assert!(matches!(config_io.read().await, Err(ConfigError::JsonError { .. })));
    }

    #[test]
    fn second_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pressensor.json");

        let first = ConfigIO::new_sync(Some(&path)).unwrap();
        let mut first_locker = first.locker().unwrap();
        let _guard = first_locker.lock().unwrap();

        let second = ConfigIO::new_sync(Some(&path)).unwrap();
        let mut second_locker = second.locker().unwrap();
        assert!(matches!(second_locker.lock(), Err(ConfigError::CanNotLock { .. })));
    }
}
