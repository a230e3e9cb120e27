use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::store::{CacheStore, Ttl};
use super::LOOKUP_PREFIX;

/// What kind of Spotify lookup a cached result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupKind {
    Search,
    Track,
    Artist,
    Album,
}

impl LookupKind {
    pub fn ttl(self) -> Ttl {
        match self {
            LookupKind::Search => Ttl::minutes(30),
            LookupKind::Track => Ttl::hours(1),
            LookupKind::Artist | LookupKind::Album => Ttl::hours(2),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LookupKind::Search => "search",
            LookupKind::Track => "track",
            LookupKind::Artist => "artist",
            LookupKind::Album => "album",
        }
    }
}

impl fmt::Display for LookupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache of Spotify catalog lookups so enrichment works offline and
/// repeated searches skip the network.
pub struct LookupCache {
    store: Arc<CacheStore>,
}

impl LookupCache {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    pub fn cache_search<T: Serialize + ?Sized>(&self, query: &str, search_type: &str, results: &T) -> bool {
        let key = Self::cache_key(LookupKind::Search, &format!("{query}:{search_type}"));
        self.store.set(&key, results, LookupKind::Search.ttl())
    }

    pub fn cached_search<T: DeserializeOwned>(&self, query: &str, search_type: &str) -> Option<T> {
        let key = Self::cache_key(LookupKind::Search, &format!("{query}:{search_type}"));
        self.store.get(&key)
    }

    pub fn cache_detail<T: Serialize + ?Sized>(&self, kind: LookupKind, id: &str, data: &T) -> bool {
        self.store.set(&Self::cache_key(kind, id), data, kind.ttl())
    }

    pub fn cached_detail<T: DeserializeOwned>(&self, kind: LookupKind, id: &str) -> Option<T> {
        self.store.get(&Self::cache_key(kind, id))
    }

    /// `spotify_<kind>_<hash>` where the hash covers the normalized query.
    fn cache_key(kind: LookupKind, query: &str) -> String {
        let normalized = query.trim().to_lowercase();
        let hash = blake3::hash(normalized.as_bytes());
        format!("{}{}_{}", LOOKUP_PREFIX, kind, &hash.to_hex()[..16])
    }
}
