//! Ephemeral per-participant presence.
//!
//! Awareness is not part of the document: it is last-write-wins per
//! participant, replaced wholesale on every update and removed when the
//! owning connection leaves. Nothing here is persisted.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

/// Presence metadata for one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessState {
    pub participant_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub color: String,
    /// Editor-defined cursor position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_fields: Option<serde_json::Map<String, serde_json::Value>>,
}

impl AwarenessState {
    pub fn new(
        participant_id: impl Into<String>,
        display_name: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            display_name: display_name.into(),
            color: color.into(),
            cursor: None,
            selection: None,
            custom_fields: None,
        }
    }

    /// Merge a partial update into this state.
    ///
    /// Absent fields are kept. A JSON `null` cursor or selection clears it,
    /// and custom fields are merged key by key with `null` removing a key.
    pub fn apply_patch(&mut self, patch: AwarenessPatch) {
        if let Some(display_name) = patch.display_name {
            self.display_name = display_name;
        }
        if let Some(color) = patch.color {
            self.color = color;
        }
        if let Some(cursor) = patch.cursor {
            self.cursor = cursor.filter(|c| !c.is_null());
        }
        if let Some(selection) = patch.selection {
            self.selection = selection.filter(|s| !s.is_null());
        }
        if let Some(fields) = patch.custom_fields {
            let custom = self.custom_fields.get_or_insert_with(Default::default);
            for (key, value) in fields {
                if value.is_null() {
                    custom.remove(&key);
                } else {
                    custom.insert(key, value);
                }
            }
            if custom.is_empty() {
                self.custom_fields = None;
            }
        }
    }
}

/// Partial awareness update supplied by the caller.
///
/// `cursor` and `selection` are three-state: `None` keeps the current
/// value, `Some(None)` clears it and `Some(Some(v))` sets it. On the wire
/// an absent key is `None` and `null` is `Some(None)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub cursor: Option<Option<serde_json::Value>>,
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub selection: Option<Option<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_fields: Option<serde_json::Map<String, serde_json::Value>>,
}

impl AwarenessPatch {
    pub fn cursor(cursor: serde_json::Value) -> Self {
        Self {
            cursor: Some(Some(cursor)),
            ..Self::default()
        }
    }

    pub fn selection(selection: serde_json::Value) -> Self {
        Self {
            selection: Some(Some(selection)),
            ..Self::default()
        }
    }

    /// Patch that removes both cursor and selection.
    pub fn clear_cursor() -> Self {
        Self {
            cursor: Some(None),
            selection: Some(None),
            ..Self::default()
        }
    }
}

/// Only called when the key is present, so `null` maps to `Some(None)`.
fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<serde_json::Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<serde_json::Value>::deserialize(deserializer).map(Some)
}

/// One row of a presence snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub participant_id: String,
    pub state: AwarenessState,
}

/// Mapping from participant id to last known awareness, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
    entries: IndexMap<String, AwarenessState>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a participant's entry wholesale. Returns `true` if the
    /// stored state changed.
    pub fn upsert(&mut self, participant_id: &str, mut state: AwarenessState) -> bool {
        state.participant_id = participant_id.to_string();
        match self.entries.get(participant_id) {
            Some(existing) if *existing == state => false,
            _ => {
                self.entries.insert(participant_id.to_string(), state);
                true
            }
        }
    }

    /// Remove a participant. Returns the removed state, if any.
    pub fn remove(&mut self, participant_id: &str) -> Option<AwarenessState> {
        self.entries.shift_remove(participant_id)
    }

    /// Replace the whole view with a snapshot received from the server.
    pub fn replace_all(&mut self, snapshot: Vec<PresenceEntry>) {
        self.entries = snapshot
            .into_iter()
            .map(|entry| {
                let mut state = entry.state;
                state.participant_id = entry.participant_id.clone();
                (entry.participant_id, state)
            })
            .collect();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, participant_id: &str) -> Option<&AwarenessState> {
        self.entries.get(participant_id)
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.entries.contains_key(participant_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current participants in arrival order.
    pub fn participants(&self) -> Vec<AwarenessState> {
        self.entries.values().cloned().collect()
    }

    /// Wire form of the registry.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.entries
            .iter()
            .map(|(id, state)| PresenceEntry {
                participant_id: id.clone(),
                state: state.clone(),
            })
            .collect()
    }
}
