//! Storage abstraction for the offline cache.
//!
//! - [`RedbBackend`]: redb file on disk (default, survives restarts)
//! - [`MemoryBackend`]: in-process map (tests, ephemeral sessions)
//!
//! Backends are a flat string → string key space, the same shape as a
//! browser's `localStorage`. Namespacing, TTLs and versioning live one
//! layer up in [`crate::cache::CacheStore`].

pub mod local;
pub mod memory;

pub use local::RedbBackend;
pub use memory::MemoryBackend;

use thiserror::Error;

const PROBE_KEY: &str = "__music_locker_probe__";

/// Errors a storage backend can report.
///
/// Callers need to tell a full store apart from everything else, since
/// only the former is recoverable by evicting entries.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend cannot be used at all.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Writing would push the backend past its byte quota.
    #[error("storage quota exceeded: {needed} bytes needed, limit is {limit}")]
    QuotaExceeded { needed: u64, limit: u64 },

    /// Any other backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

impl From<redb::Error> for StorageError {
    fn from(e: redb::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// A persistent string key-value space.
pub trait StorageBackend: Send + Sync {
    /// Human-readable backend name (e.g., "redb", "memory").
    fn backend_name(&self) -> &str;

    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing a missing key is not an error.
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    /// All keys currently stored, in no particular order.
    fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Check the backend accepts writes by storing and deleting a marker key.
    fn probe(&self) -> Result<(), StorageError> {
        self.set_item(PROBE_KEY, "1")?;
        self.remove_item(PROBE_KEY)
    }
}

/// Bytes an entry counts against a quota.
pub(crate) fn entry_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}
