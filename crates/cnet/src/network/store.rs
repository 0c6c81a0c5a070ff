//! JSON key-value store with a timed file lock.
//!
//! The store file holds a single JSON object mapping keys to documents.
//! Writes replace the whole file atomically (temp file + rename) so a crash
//! mid-write never leaves a torn document. A sibling `.lock` file serializes
//! access between processes; acquisition spins with a bounded timeout.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::error::{Error, Result};

/// Default bound on lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// File-backed key-value store.
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Held lock on the store; released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is owned by self.file and still open.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

impl FileStore {
    /// Open (or create the directory for) a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_path = path.with_extension("lock");
        Ok(Self { path, lock_path })
    }

    /// Acquire the store's exclusive file lock, waiting at most `timeout`.
    pub async fn lock(&self, timeout: Duration) -> Result<StoreLock> {
        let lock_path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;

            let deadline = Instant::now() + timeout;
            loop {
                // SAFETY: file is open; LOCK_NB makes the attempt non-blocking.
                let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
                if ret == 0 {
                    return Ok(StoreLock { file });
                }
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                    return Err(Error::Io(err));
                }
                if Instant::now() >= deadline {
                    return Err(Error::StoreLockTimeout(timeout));
                }
                std::thread::sleep(LOCK_RETRY_INTERVAL);
            }
        })
        .await
        .expect("store lock task never panics")
    }

    /// Read one key's document.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let map = self.read_map()?;
        let value = map
            .get(key)
            .ok_or_else(|| Error::StoreKeyNotFound(key.to_string()))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Write one key's document, replacing the file atomically.
    pub fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut map = self.read_map().unwrap_or_default();
        map.insert(key.to_string(), serde_json::to_value(value)?);

        let tmp = self.path.with_extension("tmp");
        let serialized = serde_json::to_vec_pretty(&map)?;
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Remove one key.
    pub fn remove(&self, key: &str) -> Result<()> {
        let mut map = self.read_map().unwrap_or_default();
        if map.remove(key).is_some() {
            let tmp = self.path.with_extension("tmp");
            std::fs::write(&tmp, serde_json::to_vec_pretty(&map)?)?;
            std::fs::rename(&tmp, &self.path)?;
        }
        Ok(())
    }

    /// When the store file was last written; errors if it does not exist.
    pub fn modification_time(&self) -> Result<SystemTime> {
        Ok(std::fs::metadata(&self.path)?.modified()?)
    }

    /// Whether the store file exists at all.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn read_map(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let content = match std::fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(Error::Io(e)),
        };
        if content.is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_slice(&content)?)
    }
}
