//! Local storage backend backed by redb.
//!
//! One table holds the whole key space:
//!   items: key → value (both UTF-8 strings, values are JSON documents)
//!
//! An optional byte quota mimics the per-origin limit of browser storage so
//! the cache layer's eviction path behaves the same on every backend.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};

use super::{entry_size, StorageBackend, StorageError};

const ITEMS: TableDefinition<&str, &str> = TableDefinition::new("items");

pub struct RedbBackend {
    db: Database,
    quota_bytes: Option<u64>,
}

impl RedbBackend {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: &Path, quota_bytes: Option<u64>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create storage directory {}", parent.display()))?;
        }
        let db = Database::create(path)
            .with_context(|| format!("failed to open redb at {}", path.display()))?;
        // Ensure table exists
        let txn = db.begin_write()?;
        { let _ = txn.open_table(ITEMS)?; }
        txn.commit()?;
        Ok(Self { db, quota_bytes })
    }

    /// Default location: `$XDG_DATA_HOME/music-locker/storage.redb`
    pub fn default_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .context("Failed to get data directory")?
            .join("music-locker");
        Ok(data_dir.join("storage.redb"))
    }

    /// Total bytes currently stored.
    pub fn used_bytes(&self) -> Result<u64, StorageError> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(ITEMS).map_err(redb::Error::from)?;
        usage(&table, None)
    }
}

/// Sum of entry sizes, optionally ignoring one key (the one being replaced).
fn usage<T>(table: &T, skip: Option<&str>) -> Result<u64, StorageError>
where
    T: ReadableTable<&'static str, &'static str>,
{
    let mut total = 0u64;
    for item in table.iter().map_err(redb::Error::from)? {
        let (k, v) = item.map_err(redb::Error::from)?;
        if Some(k.value()) == skip {
            continue;
        }
        total += entry_size(k.value(), v.value());
    }
    Ok(total)
}

impl StorageBackend for RedbBackend {
    fn backend_name(&self) -> &str {
        "redb"
    }

    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(ITEMS).map_err(redb::Error::from)?;
        let value = table.get(key).map_err(redb::Error::from)?;
        Ok(value.map(|v| v.value().to_string()))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        let over_quota = {
            let mut table = txn.open_table(ITEMS).map_err(redb::Error::from)?;
            let over_quota = match self.quota_bytes {
                Some(limit) => {
                    let needed = usage(&table, Some(key))? + entry_size(key, value);
                    (needed > limit).then_some((needed, limit))
                }
                None => None,
            };
            if over_quota.is_none() {
                table.insert(key, value).map_err(redb::Error::from)?;
            }
            over_quota
        };

        if let Some((needed, limit)) = over_quota {
            txn.abort().map_err(redb::Error::from)?;
            return Err(StorageError::QuotaExceeded { needed, limit });
        }
        txn.commit().map_err(redb::Error::from)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        {
            let mut table = txn.open_table(ITEMS).map_err(redb::Error::from)?;
            table.remove(key).map_err(redb::Error::from)?;
        }
        txn.commit().map_err(redb::Error::from)?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(ITEMS).map_err(redb::Error::from)?;
        let mut keys = Vec::new();
        for item in table.iter().map_err(redb::Error::from)? {
            let (k, _) = item.map_err(redb::Error::from)?;
            keys.push(k.value().to_string());
        }
        Ok(keys)
    }
}
