//! Offline cache: a namespaced, TTL-aware key-value store plus the
//! domain caches built on top of it.
//!
//! - [`CacheStore`]: envelopes, expiry, versioning, quota recovery
//! - [`CollectionCache`]: snapshot of the visible collection (24h)
//! - [`LookupCache`]: Spotify search/detail lookups (30min – 2h)
//! - [`PreferenceStore`]: user view preferences (never expire)

mod collection;
mod lookup;
mod preferences;
mod store;

pub use collection::{CollectionCache, CollectionMetadata, CollectionSnapshot, CollectionView};
pub use lookup::{LookupCache, LookupKind};
pub use preferences::{PreferenceStore, Preferences, SortOrder, ViewMode};
pub use store::{
    CacheCategory, CacheEntry, CacheOptions, CacheStats, CacheStore, Cached, CategoryUsage, Ttl,
};

/// Logical keys. The store prepends its namespace prefix.
pub(crate) const COLLECTION_KEY: &str = "collection";
pub(crate) const LOOKUP_PREFIX: &str = "spotify_";
pub(crate) const PREFERENCES_KEY: &str = "user_preferences";
pub(crate) const QUEUE_KEY: &str = "offline_queue";
