//! Core types for CRDT-based synchronization.
//!
//! This module defines room addressing, update origins, document change
//! events, and the conversions between JSON values and yrs values.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use yrs::Any;

/// Structure shape of a room's document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    /// Key-value map container
    Map,
    /// Ordered sequence container
    Sequence,
    /// Rich-text fragment with formatting attributes
    RichText,
}

impl RoomType {
    /// Name of the root container holding this room's content.
    pub fn root_name(&self) -> &'static str {
        match self {
            RoomType::Map => "map",
            RoomType::Sequence => "sequence",
            RoomType::RichText => "text",
        }
    }
}

impl std::fmt::Display for RoomType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomType::Map => write!(f, "map"),
            RoomType::Sequence => write!(f, "sequence"),
            RoomType::RichText => write!(f, "rich_text"),
        }
    }
}

impl std::str::FromStr for RoomType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "map" => Ok(RoomType::Map),
            "sequence" => Ok(RoomType::Sequence),
            "rich_text" | "richtext" | "text" => Ok(RoomType::RichText),
            _ => Err(format!("Unknown room type: {}", s)),
        }
    }
}

/// Address of a room: opaque id plus structure shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomKey {
    pub room_id: String,
    pub room_type: RoomType,
}

impl RoomKey {
    pub fn new(room_id: impl Into<String>, room_type: RoomType) -> Self {
        Self {
            room_id: room_id.into(),
            room_type,
        }
    }

    /// Get the storage key for this room's snapshot.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.room_type, self.room_id)
    }
}

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

/// Origin of a CRDT update, used to distinguish local vs remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOrigin {
    /// Update originated from local user action
    Local,

    /// Update received from a remote peer
    Remote,

    /// Update loaded from a persisted snapshot
    Snapshot,
}

impl std::fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateOrigin::Local => write!(f, "local"),
            UpdateOrigin::Remote => write!(f, "remote"),
            UpdateOrigin::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Change notification fired by a [`ReplicatedDoc`](super::ReplicatedDoc).
#[derive(Debug, Clone, PartialEq)]
pub enum DocEvent {
    /// A local mutation produced this outgoing delta.
    Local { delta: Vec<u8> },
    /// A merged update changed the document.
    Remote { origin: UpdateOrigin },
}

/// A run of rich text sharing one set of formatting attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RichTextSpan {
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl RichTextSpan {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attributes: BTreeMap::new(),
        }
    }
}

/// Formatting attributes as JSON, keyed by attribute name.
pub type TextAttributes = BTreeMap<String, serde_json::Value>;

/// Convert a JSON value into a yrs value.
pub fn json_to_any(value: &serde_json::Value) -> Any {
    match value {
        serde_json::Value::Null => Any::Null,
        serde_json::Value::Bool(b) => Any::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or(0.0)),
        },
        serde_json::Value::String(s) => Any::String(Arc::from(s.as_str())),
        serde_json::Value::Array(items) => {
            let items: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(items.into())
        }
        serde_json::Value::Object(fields) => {
            let fields: HashMap<String, Any> = fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect();
            Any::Map(Arc::new(fields))
        }
    }
}

/// Convert a yrs value into JSON. Binary buffers become arrays of bytes.
pub fn any_to_json(value: &Any) -> serde_json::Value {
    match value {
        Any::Null | Any::Undefined => serde_json::Value::Null,
        Any::Bool(b) => serde_json::Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Any::BigInt(i) => serde_json::Value::Number((*i).into()),
        Any::String(s) => serde_json::Value::String(s.to_string()),
        Any::Buffer(bytes) => serde_json::Value::Array(
            bytes
                .iter()
                .map(|b| serde_json::Value::Number((*b).into()))
                .collect(),
        ),
        Any::Array(items) => serde_json::Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(fields) => {
            // Sorted keys keep the JSON view identical across replicas
            let sorted: BTreeMap<&String, &Any> = fields.iter().collect();
            serde_json::Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), any_to_json(v)))
                    .collect(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_room_type_parse() {
        assert_eq!("map".parse::<RoomType>().unwrap(), RoomType::Map);
        assert_eq!("sequence".parse::<RoomType>().unwrap(), RoomType::Sequence);
        assert_eq!("rich_text".parse::<RoomType>().unwrap(), RoomType::RichText);
        assert!("graph".parse::<RoomType>().is_err());
    }

    #[test]
    fn test_room_key_storage_key() {
        let key = RoomKey::new("doc-1", RoomType::RichText);
        assert_eq!(key.storage_key(), "rich_text:doc-1");
    }

    #[test]
    fn test_json_any_conversion_preserves_values() {
        let value = json!({
            "title": "Hello",
            "count": 3,
            "ratio": 0.5,
            "tags": ["a", "b"],
            "nested": { "done": true, "missing": null }
        });
        assert_eq!(any_to_json(&json_to_any(&value)), value);
    }
}
