use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::action::{Action, ActionError};

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

/// Lifecycle of a queued action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Drain order: `High` sorts first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{other}' (expected high, normal or low)")),
        }
    }
}

/// One persisted queue entry.
///
/// `action` and `payload` stay untyped on disk so an entry written by a
/// newer build, or damaged by hand, can still be loaded and discarded
/// cleanly when it comes up for sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: i64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
}

impl QueueItem {
    pub fn new(id: String, action: &Action, priority: Priority, metadata: Option<Value>, now_ms: i64) -> Self {
        Self {
            id,
            action: action.name().to_string(),
            payload: action.payload(),
            timestamp: now_ms,
            retries: 0,
            status: ItemStatus::Pending,
            priority,
            metadata,
            next_retry: None,
            last_attempt: None,
            error: None,
            failed_at: None,
        }
    }

    pub fn decode(&self) -> Result<Action, ActionError> {
        Action::from_parts(&self.action, &self.payload)
    }

    /// Pending and not waiting out a backoff.
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.status == ItemStatus::Pending && self.next_retry.map_or(true, |at| at <= now_ms)
    }

    /// Priority first, then oldest first.
    pub fn drain_order(a: &QueueItem, b: &QueueItem) -> Ordering {
        a.priority
            .cmp(&b.priority)
            .then(a.timestamp.cmp(&b.timestamp))
    }

    /// Return a failed item to the pending state with a fresh retry budget.
    pub fn reset(&mut self) {
        self.status = ItemStatus::Pending;
        self.retries = 0;
        self.next_retry = None;
        self.error = None;
        self.failed_at = None;
    }
}

/// `<ms>_<9 random base36 chars>`
pub fn generate_id(now_ms: i64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{now_ms}_{suffix}")
}
