use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::store::{CacheStore, Ttl};
use super::COLLECTION_KEY;
use crate::models::{merge_json, MusicEntry};

const COLLECTION_TTL: Duration = Duration::from_secs(24 * 3600);

/// Filter/sort state the snapshot was rendered with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionView {
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub total_count: usize,
    #[serde(flatten)]
    pub view: CollectionView,
    pub cached_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub entries: Vec<MusicEntry>,
    pub metadata: CollectionMetadata,
}

/// Snapshot of the collection the user last saw, for offline browsing.
pub struct CollectionCache {
    store: Arc<CacheStore>,
}

impl CollectionCache {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    pub fn cache_collection(&self, entries: &[MusicEntry], view: CollectionView) -> bool {
        let snapshot = CollectionSnapshot {
            entries: entries.to_vec(),
            metadata: CollectionMetadata {
                total_count: entries.len(),
                view,
                cached_at: self.store.now_ms(),
            },
        };
        self.store.set(COLLECTION_KEY, &snapshot, Ttl::For(COLLECTION_TTL))
    }

    pub fn cached_collection(&self) -> Option<CollectionSnapshot> {
        self.store.get(COLLECTION_KEY)
    }

    pub fn cached_entry(&self, entry_id: u64) -> Option<MusicEntry> {
        self.cached_collection()?
            .entries
            .into_iter()
            .find(|e| e.id == entry_id)
    }

    /// Merge `patch` into one cached entry. The snapshot keeps its
    /// original expiry. Returns false if there is no snapshot, no such
    /// entry, or the patched entry no longer parses.
    pub fn update_cached_entry(&self, entry_id: u64, patch: &Value) -> bool {
        self.modify(|snapshot| {
            let Some(entry) = snapshot.entries.iter_mut().find(|e| e.id == entry_id) else {
                return false;
            };
            let mut merged = match serde_json::to_value(&*entry) {
                Ok(v) => v,
                Err(_) => return false,
            };
            merge_json(&mut merged, patch);
            match serde_json::from_value::<MusicEntry>(merged) {
                Ok(updated) if updated.id == entry_id => {
                    *entry = updated;
                    true
                }
                Ok(_) => false,
                Err(e) => {
                    debug!("Rejected patch for cached entry {}: {}", entry_id, e);
                    false
                }
            }
        })
    }

    pub fn remove_cached_entry(&self, entry_id: u64) -> bool {
        self.modify(|snapshot| {
            let before = snapshot.entries.len();
            snapshot.entries.retain(|e| e.id != entry_id);
            if snapshot.entries.len() == before {
                return false;
            }
            snapshot.metadata.total_count = snapshot.entries.len();
            true
        })
    }

    pub fn clear(&self) {
        self.store.remove(COLLECTION_KEY);
    }

    /// Read-modify-write that preserves the remaining TTL.
    fn modify<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut CollectionSnapshot) -> bool,
    {
        let Some(cached) = self.store.get_with_metadata::<CollectionSnapshot>(COLLECTION_KEY) else {
            return false;
        };
        let mut snapshot = cached.data;
        if !f(&mut snapshot) {
            return false;
        }
        let remaining = COLLECTION_TTL.saturating_sub(cached.age);
        self.store.set(COLLECTION_KEY, &snapshot, Ttl::For(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::CacheOptions;
    use crate::clock::ManualClock;
    use crate::storage::MemoryBackend;
    use serde_json::json;

    fn cache() -> (Arc<ManualClock>, CollectionCache) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = CacheStore::new(Box::new(MemoryBackend::new()), CacheOptions::default(), clock.clone());
        (clock, CollectionCache::new(Arc::new(store)))
    }

    fn entries() -> Vec<MusicEntry> {
        vec![MusicEntry::new(1, "A", ""), MusicEntry::new(2, "B", "")]
    }

    #[test]
    fn test_cache_and_read_back() {
        let (clock, cache) = cache();
        assert!(cache.cache_collection(&entries(), CollectionView::default()));
        clock.advance(Duration::from_secs(23 * 3600));

        let snapshot = cache.cached_collection().unwrap();
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.metadata.total_count, 2);
        assert_eq!(snapshot.entries[1].title, "B");
    }

    #[test]
    fn test_snapshot_expires_after_a_day() {
        let (clock, cache) = cache();
        cache.cache_collection(&entries(), CollectionView::default());
        clock.advance(Duration::from_secs(24 * 3600 + 1));
        assert!(cache.cached_collection().is_none());
    }

    #[test]
    fn test_view_metadata_is_kept() {
        let (_clock, cache) = cache();
        let mut filters = BTreeMap::new();
        filters.insert("genre".to_string(), "jazz".to_string());
        let view = CollectionView {
            filters,
            sort_by: Some("title".to_string()),
            sort_order: Some("asc".to_string()),
            page: Some(2),
        };
        cache.cache_collection(&entries(), view.clone());

        assert_eq!(cache.cached_collection().unwrap().metadata.view, view);
    }

    #[test]
    fn test_update_single_entry() {
        let (_clock, cache) = cache();
        cache.cache_collection(&entries(), CollectionView::default());

        assert!(cache.update_cached_entry(2, &json!({"is_favorite": true, "personal_rating": 5})));

        let updated = cache.cached_entry(2).unwrap();
        assert!(updated.is_favorite);
        assert_eq!(updated.personal_rating, Some(5));
        let untouched = cache.cached_entry(1).unwrap();
        assert!(!untouched.is_favorite);
    }

    #[test]
    fn test_update_keeps_original_expiry() {
        let (clock, cache) = cache();
        cache.cache_collection(&entries(), CollectionView::default());
        clock.advance(Duration::from_secs(20 * 3600));
        assert!(cache.update_cached_entry(1, &json!({"title": "A2"})));

        clock.advance(Duration::from_secs(5 * 3600));
        assert!(cache.cached_collection().is_none());
    }

    #[test]
    fn test_update_rejects_missing_entry_and_bad_patch() {
        let (_clock, cache) = cache();
        assert!(!cache.update_cached_entry(1, &json!({"title": "x"})));

        cache.cache_collection(&entries(), CollectionView::default());
        assert!(!cache.update_cached_entry(99, &json!({"title": "x"})));
        assert!(!cache.update_cached_entry(1, &json!({"title": 12})));
        assert!(!cache.update_cached_entry(1, &json!({"id": 5})));
        assert_eq!(cache.cached_entry(1).unwrap().title, "A");
    }

    #[test]
    fn test_remove_cached_entry() {
        let (_clock, cache) = cache();
        cache.cache_collection(&entries(), CollectionView::default());

        assert!(cache.remove_cached_entry(1));
        assert!(!cache.remove_cached_entry(1));
        let snapshot = cache.cached_collection().unwrap();
        assert_eq!(snapshot.metadata.total_count, 1);
        assert_eq!(snapshot.entries[0].id, 2);

        cache.clear();
        assert!(cache.cached_collection().is_none());
    }
}
