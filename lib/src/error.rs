//! Error taxonomy shared by every component of the store.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the store, its substores and its connections.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Invalid configuration, or configuration attempted after initialization.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Another store instance holds the data directory.
    #[error("data directory {path:?} is locked by another store instance: {reason}")]
    DirectoryLocked { path: PathBuf, reason: String },

    /// Unresolvable id, undecodable record or diverging indexes.
    #[error("store corruption: {0}")]
    Corruption(String),

    /// A lock could not be acquired within the configured timeout.
    #[error("timed out after {waited:?} waiting for the {kind} lock")]
    LockTimeout { kind: &'static str, waited: Duration },

    /// Operation attempted on a closed connection.
    #[error("connection has been closed")]
    ConnectionClosed,

    /// Underlying file I/O failure.
    #[error("storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    /// A term in a position that cannot hold it, such as a literal subject.
    #[error("invalid term: {0}")]
    InvalidTerm(String),

    /// Operation called before (or after) the lifecycle step it requires.
    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl StoreError {
    /// Only lock timeouts leave the caller free to simply retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }

    /// True for errors that poison the connection that observed them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::StorageIo(_) | StoreError::Corruption(_))
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        StoreError::Corruption(msg.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corruption(format!("unreadable metadata: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_recoverable() {
        let timeout = StoreError::LockTimeout {
            kind: "transaction",
            waited: Duration::from_millis(5),
        };
        assert!(timeout.is_recoverable());
        assert!(!timeout.is_fatal());
        assert!(!StoreError::ConnectionClosed.is_recoverable());
        let io = StoreError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        assert!(io.is_fatal());
        assert!(!io.is_recoverable());
    }
}
