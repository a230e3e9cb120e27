use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::models::EntryForm;

/// A user mutation that can be replayed against the backend.
///
/// Serialized adjacently tagged, so the persisted form is
/// `{"action": "<snake_case name>", "payload": {…}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum Action {
    ToggleFavorite {
        entry_id: u64,
    },
    UpdateRating {
        entry_id: u64,
        rating: u8,
    },
    DeleteEntry {
        entry_id: u64,
    },
    AddEntry(EntryForm),
    UpdateEntry {
        entry_id: u64,
        fields: EntryForm,
    },
    AddNote {
        entry_id: u64,
        note_text: String,
        #[serde(default)]
        mood: Option<String>,
    },
    AddTag {
        entry_id: u64,
        tag_id: u64,
    },
}

pub const ACTION_NAMES: [&str; 7] = [
    "toggle_favorite",
    "update_rating",
    "delete_entry",
    "add_entry",
    "update_entry",
    "add_note",
    "add_tag",
];

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("unknown action type '{0}'")]
    Unknown(String),

    #[error("invalid payload for '{action}': {source}")]
    InvalidPayload {
        action: String,
        source: serde_json::Error,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::ToggleFavorite { .. } => "toggle_favorite",
            Action::UpdateRating { .. } => "update_rating",
            Action::DeleteEntry { .. } => "delete_entry",
            Action::AddEntry(_) => "add_entry",
            Action::UpdateEntry { .. } => "update_entry",
            Action::AddNote { .. } => "add_note",
            Action::AddTag { .. } => "add_tag",
        }
    }

    /// The entry this action targets; `None` for new entries.
    pub fn entry_id(&self) -> Option<u64> {
        match self {
            Action::ToggleFavorite { entry_id }
            | Action::UpdateRating { entry_id, .. }
            | Action::DeleteEntry { entry_id }
            | Action::UpdateEntry { entry_id, .. }
            | Action::AddNote { entry_id, .. }
            | Action::AddTag { entry_id, .. } => Some(*entry_id),
            Action::AddEntry(_) => None,
        }
    }

    /// The JSON payload stored alongside the action name.
    pub fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut tagged)) => tagged.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Rebuild a typed action from its stored name and payload.
    pub fn from_parts(action: &str, payload: &Value) -> Result<Self, ActionError> {
        if !ACTION_NAMES.contains(&action) {
            return Err(ActionError::Unknown(action.to_string()));
        }
        serde_json::from_value(json!({ "action": action, "payload": payload })).map_err(|source| {
            ActionError::InvalidPayload {
                action: action.to_string(),
                source,
            }
        })
    }
}
