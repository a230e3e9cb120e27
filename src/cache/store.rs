//! Namespaced, TTL-aware key-value cache over a [`StorageBackend`].
//!
//! Every value is wrapped in a [`CacheEntry`] envelope:
//!
//! ```text
//! musiclocker_<key>      → {"data": …, "timestamp": ms, "ttl": ms|null, "version": n}
//! musiclocker_doc:<key>  → raw JSON document (no envelope, never expires)
//! ```
//!
//! The store never returns errors to callers. Failures degrade to
//! `false`/`None` and a log line; a store whose backend fails the start-up
//! probe is disabled and every operation becomes a no-op.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{COLLECTION_KEY, LOOKUP_PREFIX, PREFERENCES_KEY, QUEUE_KEY};
use crate::clock::Clock;
use crate::storage::{RedbBackend, StorageBackend};

const DEFAULT_PREFIX: &str = "musiclocker_";
const DOC_MARKER: &str = "doc:";
const CURRENT_VERSION: u32 = 1;
const DEFAULT_SOFT_CAP_BYTES: u64 = 5 * 1024 * 1024;

/// How long an entry stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Never,
    For(Duration),
}

impl Ttl {
    pub const fn minutes(m: u64) -> Self {
        Ttl::For(Duration::from_secs(m * 60))
    }

    pub const fn hours(h: u64) -> Self {
        Ttl::For(Duration::from_secs(h * 3600))
    }

    fn as_millis(self) -> Option<u64> {
        match self {
            Ttl::Never => None,
            Ttl::For(d) => Some(d.as_millis() as u64),
        }
    }
}

/// Stored form of every cached value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Value,
    pub timestamp: i64,
    /// Milliseconds; `None` never expires.
    pub ttl: Option<u64>,
    pub version: u32,
}

impl CacheEntry {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self.ttl {
            Some(ttl) => match now_ms.checked_sub(self.timestamp) {
                Some(age) => age > i64::try_from(ttl).unwrap_or(i64::MAX),
                None => true,
            },
            None => false,
        }
    }
}

/// A cache hit together with when it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub data: T,
    pub timestamp: i64,
    pub age: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Namespace prepended to every key.
    pub prefix: String,
    /// Entries written under any other version are treated as absent.
    pub version: u32,
    /// Soft cap reported in [`CacheStats`]. Going over it logs a warning
    /// but nothing is evicted.
    pub soft_cap_bytes: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            version: CURRENT_VERSION,
            soft_cap_bytes: DEFAULT_SOFT_CAP_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheCategory {
    Collection,
    Lookups,
    Preferences,
    Queue,
    Other,
}

impl CacheCategory {
    fn of(logical_key: &str) -> Self {
        if logical_key == QUEUE_KEY {
            Self::Queue
        } else if logical_key == PREFERENCES_KEY {
            Self::Preferences
        } else if logical_key.starts_with(COLLECTION_KEY) {
            Self::Collection
        } else if logical_key.starts_with(LOOKUP_PREFIX) {
            Self::Lookups
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryUsage {
    pub entries: usize,
    pub bytes: u64,
}

impl CategoryUsage {
    fn add(&mut self, bytes: u64) {
        self.entries += 1;
        self.bytes += bytes;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub total_bytes: u64,
    pub entry_count: usize,
    pub soft_cap_bytes: u64,
    pub usage_percent: f64,
    pub collection: CategoryUsage,
    pub lookups: CategoryUsage,
    pub preferences: CategoryUsage,
    pub queue: CategoryUsage,
    pub other: CategoryUsage,
}

impl CacheStats {
    pub fn category(&self, category: CacheCategory) -> CategoryUsage {
        match category {
            CacheCategory::Collection => self.collection,
            CacheCategory::Lookups => self.lookups,
            CacheCategory::Preferences => self.preferences,
            CacheCategory::Queue => self.queue,
            CacheCategory::Other => self.other,
        }
    }

    fn category_mut(&mut self, category: CacheCategory) -> &mut CategoryUsage {
        match category {
            CacheCategory::Collection => &mut self.collection,
            CacheCategory::Lookups => &mut self.lookups,
            CacheCategory::Preferences => &mut self.preferences,
            CacheCategory::Queue => &mut self.queue,
            CacheCategory::Other => &mut self.other,
        }
    }
}

/// Result of inspecting one stored envelope.
enum Lookup {
    Missing,
    Live(CacheEntry),
    Stale(&'static str),
}

pub struct CacheStore {
    backend: Option<Box<dyn StorageBackend>>,
    options: CacheOptions,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    /// Wrap `backend`, probing it first. A backend that fails the probe
    /// disables the store instead of failing construction.
    pub fn new(backend: Box<dyn StorageBackend>, options: CacheOptions, clock: Arc<dyn Clock>) -> Self {
        let backend = match backend.probe() {
            Ok(()) => Some(backend),
            Err(e) => {
                warn!(
                    "Cache storage ({}) unavailable, offline cache disabled: {}",
                    backend.backend_name(),
                    e
                );
                None
            }
        };
        Self {
            backend,
            options,
            clock,
        }
    }

    /// Open the on-disk cache at `path`. A database that cannot be opened
    /// yields a disabled store.
    pub fn open(path: &Path, quota_bytes: Option<u64>, options: CacheOptions, clock: Arc<dyn Clock>) -> Self {
        match RedbBackend::open(path, quota_bytes) {
            Ok(backend) => Self::new(Box::new(backend), options, clock),
            Err(e) => {
                warn!("Failed to open cache at {}, offline cache disabled: {:#}", path.display(), e);
                Self::disabled(options, clock)
            }
        }
    }

    pub fn disabled(options: CacheOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend: None,
            options,
            clock,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn version(&self) -> u32 {
        self.options.version
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.options.prefix, key)
    }

    fn doc_key(&self, key: &str) -> String {
        format!("{}{}{}", self.options.prefix, DOC_MARKER, key)
    }

    /// Logical key for a full key, and whether it names a document.
    fn logical_key<'a>(&self, full_key: &'a str) -> Option<(&'a str, bool)> {
        let rest = full_key.strip_prefix(self.options.prefix.as_str())?;
        match rest.strip_prefix(DOC_MARKER) {
            Some(doc) => Some((doc, true)),
            None => Some((rest, false)),
        }
    }

    // ── Envelopes ────────────────────────────────────────────────────

    /// Store `data` under `key`. Returns whether the write landed.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T, ttl: Ttl) -> bool {
        let Some(backend) = self.backend.as_deref() else {
            return false;
        };
        let data = match serde_json::to_value(data) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to serialize cache entry {}: {}", key, e);
                return false;
            }
        };
        let entry = CacheEntry {
            data,
            timestamp: self.clock.now_ms(),
            ttl: ttl.as_millis(),
            version: self.options.version,
        };
        match serde_json::to_string(&entry) {
            Ok(raw) => self.write(backend, &self.full_key(key), &raw),
            Err(e) => {
                warn!("Failed to serialize cache entry {}: {}", key, e);
                false
            }
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_with_metadata(key).map(|cached| cached.data)
    }

    pub fn get_with_metadata<T: DeserializeOwned>(&self, key: &str) -> Option<Cached<T>> {
        let entry = self.read_entry(key)?;
        let age_ms = self.clock.now_ms().saturating_sub(entry.timestamp).max(0) as u64;
        match serde_json::from_value(entry.data) {
            Ok(data) => Some(Cached {
                data,
                timestamp: entry.timestamp,
                age: Duration::from_millis(age_ms),
            }),
            Err(e) => {
                debug!("Cache entry {} has unexpected shape: {}", key, e);
                None
            }
        }
    }

    /// The raw envelope, after expiry and version checks.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.read_entry(key)
    }

    pub fn remove(&self, key: &str) {
        if let Some(backend) = self.backend.as_deref() {
            delete(backend, &self.full_key(key));
        }
    }

    fn read_entry(&self, key: &str) -> Option<CacheEntry> {
        let backend = self.backend.as_deref()?;
        let full_key = self.full_key(key);
        match self.inspect(backend, &full_key) {
            Lookup::Live(entry) => Some(entry),
            Lookup::Missing => None,
            Lookup::Stale(reason) => {
                debug!("Purging {} cache entry {}", reason, key);
                delete(backend, &full_key);
                None
            }
        }
    }

    fn inspect(&self, backend: &dyn StorageBackend, full_key: &str) -> Lookup {
        let raw = match backend.get_item(full_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Lookup::Missing,
            Err(e) => {
                warn!("Cache read for {} failed: {}", full_key, e);
                return Lookup::Missing;
            }
        };
        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(_) => return Lookup::Stale("corrupt"),
        };
        if entry.version != self.options.version {
            return Lookup::Stale("outdated");
        }
        if entry.is_expired(self.clock.now_ms()) {
            return Lookup::Stale("expired");
        }
        Lookup::Live(entry)
    }

    // ── Documents ────────────────────────────────────────────────────

    /// Store a raw JSON document. Documents skip the envelope, so they
    /// never expire and survive cache version bumps.
    pub fn put_document<T: Serialize + ?Sized>(&self, key: &str, doc: &T) -> bool {
        let Some(backend) = self.backend.as_deref() else {
            return false;
        };
        match serde_json::to_string(doc) {
            Ok(raw) => self.write(backend, &self.doc_key(key), &raw),
            Err(e) => {
                warn!("Failed to serialize document {}: {}", key, e);
                false
            }
        }
    }

    pub fn document<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let backend = self.backend.as_deref()?;
        let full_key = self.doc_key(key);
        let raw = match backend.get_item(&full_key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Document read for {} failed: {}", key, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!("Document {} is corrupt, discarding: {}", key, e);
                delete(backend, &full_key);
                None
            }
        }
    }

    pub fn remove_document(&self, key: &str) {
        if let Some(backend) = self.backend.as_deref() {
            delete(backend, &self.doc_key(key));
        }
    }

    // ── Namespace-wide operations ────────────────────────────────────

    /// Remove every key under this store's prefix, documents included.
    pub fn clear_all(&self) -> usize {
        let Some(backend) = self.backend.as_deref() else {
            return 0;
        };
        let keys = self.namespaced_keys(backend);
        for key in &keys {
            delete(backend, key);
        }
        info!("Cleared {} cache keys", keys.len());
        keys.len()
    }

    /// Purge every expired, outdated or corrupt envelope. Returns how many
    /// entries were removed.
    pub fn clean_expired_cache(&self) -> usize {
        match self.backend.as_deref() {
            Some(backend) => self.sweep(backend),
            None => 0,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            soft_cap_bytes: self.options.soft_cap_bytes,
            ..CacheStats::default()
        };
        let Some(backend) = self.backend.as_deref() else {
            return stats;
        };

        for full_key in self.namespaced_keys(backend) {
            let Some((logical, _)) = self.logical_key(&full_key) else {
                continue;
            };
            let value_len = match backend.get_item(&full_key) {
                Ok(Some(raw)) => raw.len(),
                _ => continue,
            };
            let bytes = (full_key.len() + value_len) as u64;
            stats.total_bytes += bytes;
            stats.entry_count += 1;
            stats.category_mut(CacheCategory::of(logical)).add(bytes);
        }

        if stats.soft_cap_bytes > 0 {
            stats.usage_percent = stats.total_bytes as f64 * 100.0 / stats.soft_cap_bytes as f64;
            if stats.total_bytes > stats.soft_cap_bytes {
                warn!(
                    "Cache uses {} bytes, above the {} byte soft cap",
                    stats.total_bytes, stats.soft_cap_bytes
                );
            }
        }
        stats
    }

    fn namespaced_keys(&self, backend: &dyn StorageBackend) -> Vec<String> {
        match backend.keys() {
            Ok(keys) => keys
                .into_iter()
                .filter(|k| k.starts_with(self.options.prefix.as_str()))
                .collect(),
            Err(e) => {
                warn!("Failed to list cache keys: {}", e);
                Vec::new()
            }
        }
    }

    fn sweep(&self, backend: &dyn StorageBackend) -> usize {
        let mut removed = 0;
        for full_key in self.namespaced_keys(backend) {
            if matches!(self.logical_key(&full_key), Some((_, true))) {
                continue;
            }
            if let Lookup::Stale(reason) = self.inspect(backend, &full_key) {
                debug!("Sweeping {} cache entry {}", reason, full_key);
                delete(backend, &full_key);
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} stale cache entries", removed);
        }
        removed
    }

    // ── Writes & quota recovery ──────────────────────────────────────

    fn write(&self, backend: &dyn StorageBackend, full_key: &str, raw: &str) -> bool {
        match backend.set_item(full_key, raw) {
            Ok(()) => true,
            Err(e) if e.is_quota_exceeded() => {
                warn!("{} while writing {}, evicting old cache entries", e, full_key);
                self.recover_quota(backend);
                match backend.set_item(full_key, raw) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Cache write for {} failed after eviction: {}", full_key, e);
                        false
                    }
                }
            }
            Err(e) => {
                warn!("Cache write for {} failed: {}", full_key, e);
                false
            }
        }
    }

    /// Drop stale entries, then the oldest quarter of what is left.
    /// Preferences and documents are never evicted.
    fn recover_quota(&self, backend: &dyn StorageBackend) -> usize {
        let mut removed = self.sweep(backend);

        let mut candidates: Vec<(i64, String)> = self
            .namespaced_keys(backend)
            .into_iter()
            .filter(|full_key| match self.logical_key(full_key) {
                Some((logical, is_doc)) => !is_doc && logical != PREFERENCES_KEY,
                None => false,
            })
            .filter_map(|full_key| match self.inspect(backend, &full_key) {
                Lookup::Live(entry) => Some((entry.timestamp, full_key)),
                _ => None,
            })
            .collect();
        candidates.sort_by_key(|(timestamp, _)| *timestamp);

        let evict = candidates.len().div_ceil(4);
        for (_, full_key) in candidates.into_iter().take(evict) {
            delete(backend, &full_key);
        }
        removed += evict;

        info!("Quota recovery removed {} cache entries", removed);
        removed
    }
}

fn delete(backend: &dyn StorageBackend, full_key: &str) {
    if let Err(e) = backend.remove_item(full_key) {
        warn!("Failed to remove cache key {}: {}", full_key, e);
    }
}
