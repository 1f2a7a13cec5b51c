//! Inter-process exclusive lock on a store's data directory.

use crate::error::{Result, StoreError};
use fs2::FileExt;
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = "lock";

/// Holds `<dir>/lock` exclusively until released or dropped.
pub struct DirectoryLock {
    path: PathBuf,
    file: Option<File>,
}

impl DirectoryLock {
    /// Fails immediately with [`StoreError::DirectoryLocked`] if another
    /// store instance holds the directory.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        if let Err(e) = file.try_lock_exclusive() {
            return Err(StoreError::DirectoryLocked {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            });
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        debug!("Locked data directory {}", dir.display());
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.unlock() {
                warn!("Failed to unlock {}: {e}", self.path.display());
            }
        }
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempdir().unwrap();
        let mut first = DirectoryLock::acquire(dir.path()).unwrap();
        match DirectoryLock::acquire(dir.path()) {
            Err(StoreError::DirectoryLocked { path, .. }) => assert_eq!(path, dir.path()),
            other => panic!("expected DirectoryLocked, got {:?}", other.map(|_| ())),
        }
        first.release();
        assert!(DirectoryLock::acquire(dir.path()).is_ok());
    }
}
