//! Offline cache and action sync queue for Music Locker.
//!
//! Browsing data (the collection snapshot, Spotify lookups, preferences) is
//! cached locally with expiry, and user mutations made while offline are
//! queued and replayed against the server once connectivity returns.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod models;
pub mod network;
pub mod queue;
pub mod scheduler;
pub mod storage;

pub use api::ApiClient;
pub use cache::{CacheStore, CollectionCache, LookupCache, PreferenceStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use network::{NetworkMonitor, NetworkStatus};
pub use queue::{Action, ActionOptions, ActionQueue, DrainOutcome, QueueEvent, SyncHandler};
