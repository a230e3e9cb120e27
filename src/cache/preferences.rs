use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::store::{CacheStore, Ttl};
use super::PREFERENCES_KEY;
use crate::models::merge_json;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    Grid,
    List,
}

/// How the user likes their collection laid out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub filters: BTreeMap<String, String>,
    pub sort_by: String,
    pub sort_order: SortOrder,
    pub view_mode: ViewMode,
    pub per_page: u32,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            filters: BTreeMap::new(),
            sort_by: "created_at".to_string(),
            sort_order: SortOrder::Desc,
            view_mode: ViewMode::Grid,
            per_page: 20,
        }
    }
}

/// Preferences persist without expiry and are exempt from quota eviction.
pub struct PreferenceStore {
    store: Arc<CacheStore>,
}

impl PreferenceStore {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    /// Stored preferences, or defaults when nothing is saved.
    pub fn get(&self) -> Preferences {
        self.store.get(PREFERENCES_KEY).unwrap_or_default()
    }

    pub fn set(&self, prefs: &Preferences) -> bool {
        self.store.set(PREFERENCES_KEY, prefs, Ttl::Never)
    }

    pub fn update<F: FnOnce(&mut Preferences)>(&self, f: F) -> bool {
        let mut prefs = self.get();
        f(&mut prefs);
        self.set(&prefs)
    }

    /// Shallow-merge JSON fields over the current preferences.
    pub fn patch(&self, patch: &Value) -> bool {
        let mut merged = match serde_json::to_value(self.get()) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to serialize preferences: {}", e);
                return false;
            }
        };
        merge_json(&mut merged, patch);
        match serde_json::from_value::<Preferences>(merged) {
            Ok(prefs) => self.set(&prefs),
            Err(e) => {
                warn!("Ignoring invalid preference patch: {}", e);
                false
            }
        }
    }

    pub fn reset(&self) {
        self.store.remove(PREFERENCES_KEY);
    }
}
