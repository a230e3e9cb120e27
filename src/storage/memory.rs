//! In-process storage backend.
//!
//! Nothing survives the process. Useful for tests, and for simulating a
//! full or broken store without touching the filesystem.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{entry_size, StorageBackend, StorageError};

pub struct MemoryBackend {
    items: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<u64>,
    available: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            quota_bytes: None,
            available: true,
        }
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::new()
        }
    }

    /// A backend that refuses every operation.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.items
            .lock()
            .map(|items| items.iter().map(|(k, v)| entry_size(k, v)).sum())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, StorageError> {
        if !self.available {
            return Err(StorageError::Unavailable("memory backend disabled".to_string()));
        }
        self.items
            .lock()
            .map_err(|e| StorageError::Backend(format!("lock poisoned: {e}")))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    fn backend_name(&self) -> &str {
        "memory"
    }

    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.lock()?;
        if let Some(limit) = self.quota_bytes {
            let others: u64 = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| entry_size(k, v))
                .sum();
            let needed = others + entry_size(key, value);
            if needed > limit {
                return Err(StorageError::QuotaExceeded { needed, limit });
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_and_remove() {
        let backend = MemoryBackend::new();
        backend.set_item("a", "1").unwrap();
        assert_eq!(backend.get_item("a").unwrap().as_deref(), Some("1"));
        backend.remove_item("a").unwrap();
        backend.remove_item("a").unwrap();
        assert!(backend.get_item("a").unwrap().is_none());
    }

    #[test]
    fn test_quota() {
        let backend = MemoryBackend::with_quota(10);
        backend.set_item("ab", "12345678").unwrap();
        assert_eq!(backend.used_bytes(), 10);

        let err = backend.set_item("c", "1").unwrap_err();
        assert!(err.is_quota_exceeded());

        backend.remove_item("ab").unwrap();
        backend.set_item("c", "1").unwrap();
    }

    #[test]
    fn test_unavailable_backend_fails_probe() {
        let backend = MemoryBackend::unavailable();
        assert!(matches!(backend.probe(), Err(StorageError::Unavailable(_))));
        assert!(backend.keys().is_err());
    }
}
