//! Mergeable document for one room.
//!
//! This module provides `ReplicatedDoc`, a Y.Doc wrapper exposing the
//! mutation entry points for each room shape (map, sequence, rich text)
//! and a merge entry point for deltas arriving from any source.
//!
//! Every local mutation runs in its own transaction and produces a delta
//! (the diff against the state vector captured before the mutation).
//! Listeners receive [`DocEvent::Local`] with that delta, or
//! [`DocEvent::Remote`] after a merge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use yrs::types::text::{Diff, YChange};
use yrs::types::{Attrs, ToJson};
use yrs::{
    Any, Array, ArrayRef, Doc, GetString, Map, MapRef, OffsetKind, Options, Out, ReadTxn,
    StateVector, Text, TextRef, Transact, Update, updates::decoder::Decode,
    updates::encoder::Encode,
};

use super::types::{
    DocEvent, RichTextSpan, RoomType, TextAttributes, UpdateOrigin, any_to_json, json_to_any,
};
use crate::error::{Result, TandemError};

/// Encoding of an update with no structs and an empty delete set.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Identifier returned by [`ReplicatedDoc::subscribe`].
pub type SubscriptionId = u64;

type Listener = Arc<dyn Fn(&DocEvent) + Send + Sync>;

/// Root container of the document, selected by the room type.
#[derive(Clone)]
enum Root {
    Map(MapRef),
    Sequence(ArrayRef),
    Text(TextRef),
}

/// A CRDT document holding one room's content.
///
/// # Example
///
/// ```ignore
/// use tandem_core::crdt::{ReplicatedDoc, RoomType};
/// use serde_json::json;
///
/// let doc = ReplicatedDoc::new(RoomType::Map);
/// let delta = doc.map_set("title", json!("Hello"))?;
///
/// let peer = ReplicatedDoc::new(RoomType::Map);
/// peer.apply_update(&delta.unwrap(), UpdateOrigin::Remote)?;
/// assert_eq!(peer.map_get("title"), Some(json!("Hello")));
/// ```
pub struct ReplicatedDoc {
    doc: Doc,
    room_type: RoomType,
    root: Root,
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
}

impl ReplicatedDoc {
    /// Create a new empty document with a random client id.
    pub fn new(room_type: RoomType) -> Self {
        let options = Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        };
        Self::with_options(room_type, options)
    }

    /// Create a new empty document with a fixed client id.
    ///
    /// Two replicas must never share a client id.
    pub fn with_client_id(room_type: RoomType, client_id: u64) -> Self {
        let mut options = Options::with_client_id(client_id);
        options.offset_kind = OffsetKind::Utf16;
        Self::with_options(room_type, options)
    }

    fn with_options(room_type: RoomType, options: Options) -> Self {
        let doc = Doc::with_options(options);
        let root = match room_type {
            RoomType::Map => Root::Map(doc.get_or_insert_map(room_type.root_name())),
            RoomType::Sequence => Root::Sequence(doc.get_or_insert_array(room_type.root_name())),
            RoomType::RichText => Root::Text(doc.get_or_insert_text(room_type.root_name())),
        };
        Self {
            doc,
            room_type,
            root,
            listeners: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Build a document from a persisted or transmitted snapshot.
    pub fn from_snapshot(room_type: RoomType, snapshot: &[u8]) -> Result<Self> {
        let doc = Self::new(room_type);
        if !snapshot.is_empty() {
            doc.apply_update(snapshot, UpdateOrigin::Snapshot)?;
        }
        Ok(doc)
    }

    /// Get the room type this document was created for.
    pub fn room_type(&self) -> RoomType {
        self.room_type
    }

    /// Get the yrs client id of this replica.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    // ==================== Change Notification ====================

    /// Register a change listener. Listeners run after the transaction
    /// has been committed and must not block.
    pub fn subscribe(&self, listener: Arc<dyn Fn(&DocEvent) + Send + Sync>) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn emit(&self, event: DocEvent) {
        // Clone out so listeners may subscribe/unsubscribe re-entrantly
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }

    /// Run a local mutation and emit its delta. Returns `None` when the
    /// mutation changed nothing.
    ///
    /// Validation and the delta both happen inside the write transaction,
    /// so a merge committed concurrently can neither invalidate an index
    /// that was checked nor leak into the emitted delta.
    fn mutate<F>(&self, op: F) -> Result<Option<Vec<u8>>>
    where
        F: FnOnce(&mut yrs::TransactionMut<'_>) -> Result<()>,
    {
        let delta = {
            let mut txn = self.doc.transact_mut();
            op(&mut txn)?;
            txn.encode_update_v1()
        };

        if delta == EMPTY_UPDATE {
            return Ok(None);
        }

        log::debug!(
            "[ReplicatedDoc] Local {} mutation, delta {} bytes",
            self.room_type,
            delta.len()
        );
        self.emit(DocEvent::Local {
            delta: delta.clone(),
        });
        Ok(Some(delta))
    }

    fn wrong_shape(&self, op: &str) -> TandemError {
        TandemError::InvalidOperation(format!(
            "{} is not supported on a {} document",
            op, self.room_type
        ))
    }

    // ==================== Map Operations ====================

    /// Set a key to a JSON value.
    pub fn map_set(&self, key: &str, value: serde_json::Value) -> Result<Option<Vec<u8>>> {
        let Root::Map(map) = &self.root else {
            return Err(self.wrong_shape("map_set"));
        };
        let value = json_to_any(&value);
        self.mutate(|txn| {
            map.insert(txn, key, value);
            Ok(())
        })
    }

    /// Remove a key.
    pub fn map_remove(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Root::Map(map) = &self.root else {
            return Err(self.wrong_shape("map_remove"));
        };
        self.mutate(|txn| {
            map.remove(txn, key);
            Ok(())
        })
    }

    /// Get the value stored under a key.
    pub fn map_get(&self, key: &str) -> Option<serde_json::Value> {
        let Root::Map(map) = &self.root else {
            return None;
        };
        let txn = self.doc.transact();
        match map.to_json(&txn) {
            Any::Map(fields) => fields.get(key).map(any_to_json),
            _ => None,
        }
    }

    /// Get all keys, sorted.
    pub fn map_keys(&self) -> Vec<String> {
        let Root::Map(map) = &self.root else {
            return Vec::new();
        };
        let txn = self.doc.transact();
        let mut keys: Vec<String> = map.keys(&txn).map(String::from).collect();
        keys.sort();
        keys
    }

    // ==================== Sequence Operations ====================

    /// Insert a value before `index`. Positions are resolved to item ids
    /// inside the transaction, so concurrent inserts at the same index
    /// both survive.
    pub fn seq_insert(&self, index: u32, value: serde_json::Value) -> Result<Option<Vec<u8>>> {
        let Root::Sequence(array) = &self.root else {
            return Err(self.wrong_shape("seq_insert"));
        };
        let value = json_to_any(&value);
        self.mutate(|txn| {
            let len = array.len(&*txn);
            if index > len {
                return Err(TandemError::InvalidOperation(format!(
                    "insert index {} out of bounds (len {})",
                    index, len
                )));
            }
            array.insert(txn, index, value);
            Ok(())
        })
    }

    /// Append a value at the end of the sequence.
    pub fn seq_push(&self, value: serde_json::Value) -> Result<Option<Vec<u8>>> {
        let Root::Sequence(array) = &self.root else {
            return Err(self.wrong_shape("seq_push"));
        };
        let value = json_to_any(&value);
        self.mutate(|txn| {
            array.push_back(txn, value);
            Ok(())
        })
    }

    /// Remove `len` elements starting at `index`.
    pub fn seq_remove(&self, index: u32, len: u32) -> Result<Option<Vec<u8>>> {
        let Root::Sequence(array) = &self.root else {
            return Err(self.wrong_shape("seq_remove"));
        };
        self.mutate(|txn| {
            check_range("remove", index, len, array.len(&*txn))?;
            if len > 0 {
                array.remove_range(txn, index, len);
            }
            Ok(())
        })
    }

    /// Get the element at `index`.
    pub fn seq_get(&self, index: u32) -> Option<serde_json::Value> {
        match self.to_json() {
            serde_json::Value::Array(items) if self.room_type == RoomType::Sequence => {
                items.into_iter().nth(index as usize)
            }
            _ => None,
        }
    }

    /// Number of elements in the sequence.
    pub fn seq_len(&self) -> u32 {
        let Root::Sequence(array) = &self.root else {
            return 0;
        };
        let txn = self.doc.transact();
        array.len(&txn)
    }

    // ==================== Rich Text Operations ====================

    /// Insert text at `index` (UTF-16 code units), optionally formatted.
    pub fn text_insert(
        &self,
        index: u32,
        text: &str,
        attributes: Option<&TextAttributes>,
    ) -> Result<Option<Vec<u8>>> {
        let Root::Text(text_ref) = &self.root else {
            return Err(self.wrong_shape("text_insert"));
        };
        let attrs = attributes.map(to_attrs);
        self.mutate(|txn| {
            let len = text_ref.len(&*txn);
            if index > len {
                return Err(TandemError::InvalidOperation(format!(
                    "text index {} out of bounds (len {})",
                    index, len
                )));
            }
            if text.is_empty() {
                return Ok(());
            }
            match attrs {
                Some(attrs) => text_ref.insert_with_attributes(txn, index, text, attrs),
                None => text_ref.insert(txn, index, text),
            }
            Ok(())
        })
    }

    /// Delete `len` code units starting at `index`.
    pub fn text_delete(&self, index: u32, len: u32) -> Result<Option<Vec<u8>>> {
        let Root::Text(text_ref) = &self.root else {
            return Err(self.wrong_shape("text_delete"));
        };
        self.mutate(|txn| {
            check_range("text", index, len, text_ref.len(&*txn))?;
            if len > 0 {
                text_ref.remove_range(txn, index, len);
            }
            Ok(())
        })
    }

    /// Apply formatting attributes to a range. A `null` value clears that
    /// attribute.
    pub fn text_format(
        &self,
        index: u32,
        len: u32,
        attributes: &TextAttributes,
    ) -> Result<Option<Vec<u8>>> {
        let Root::Text(text_ref) = &self.root else {
            return Err(self.wrong_shape("text_format"));
        };
        let attrs = to_attrs(attributes);
        self.mutate(|txn| {
            check_range("format", index, len, text_ref.len(&*txn))?;
            if len > 0 && !attributes.is_empty() {
                text_ref.format(txn, index, len, attrs);
            }
            Ok(())
        })
    }

    /// Get the plain text content.
    pub fn text_string(&self) -> String {
        let Root::Text(text_ref) = &self.root else {
            return String::new();
        };
        let txn = self.doc.transact();
        text_ref.get_string(&txn)
    }

    /// Length of the text in UTF-16 code units.
    pub fn text_len(&self) -> u32 {
        let Root::Text(text_ref) = &self.root else {
            return 0;
        };
        let txn = self.doc.transact();
        text_ref.len(&txn)
    }

    /// Get the text as runs of uniformly formatted content.
    pub fn text_spans(&self) -> Vec<RichTextSpan> {
        let Root::Text(text_ref) = &self.root else {
            return Vec::new();
        };
        let txn = self.doc.transact();
        let diffs: Vec<Diff<YChange>> = text_ref.diff(&txn, YChange::identity);
        diffs
            .into_iter()
            .filter_map(|diff| {
                let Out::Any(Any::String(text)) = diff.insert else {
                    return None;
                };
                let attributes = diff
                    .attributes
                    .map(|attrs| {
                        attrs
                            .iter()
                            .map(|(k, v)| (k.to_string(), any_to_json(v)))
                            .collect()
                    })
                    .unwrap_or_default();
                Some(RichTextSpan {
                    text: text.to_string(),
                    attributes,
                })
            })
            .collect()
    }

    // ==================== Sync Operations ====================

    /// Whether the document has never integrated any operation.
    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        txn.state_vector().is_empty()
    }

    /// Get the current state vector.
    pub fn state_vector(&self) -> StateVector {
        let txn = self.doc.transact();
        txn.state_vector()
    }

    /// Encode the current state vector for sync.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full state as an update (snapshot).
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the diff between current state and a remote state vector.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| TandemError::Decode(format!("Failed to decode state vector: {}", e)))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Merge an update from any source.
    ///
    /// Malformed bytes fail with [`TandemError::Decode`] before the
    /// document is touched. Operations whose causal dependencies have not
    /// arrived yet are held by yrs and integrated once they do. Applying
    /// the same update twice is a no-op after the first time.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| TandemError::Decode(format!("Failed to decode update: {}", e)))?;

        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| TandemError::Decode(format!("Failed to apply update: {}", e)))?;
        }

        log::debug!(
            "[ReplicatedDoc] Merged {} update, {} bytes",
            origin,
            update.len()
        );
        self.emit(DocEvent::Remote { origin });
        Ok(())
    }

    /// Whole root container as JSON.
    ///
    /// Maps become objects with sorted keys, sequences become arrays, rich
    /// text becomes an array of spans.
    pub fn to_json(&self) -> serde_json::Value {
        match &self.root {
            Root::Map(map) => {
                let txn = self.doc.transact();
                any_to_json(&map.to_json(&txn))
            }
            Root::Sequence(array) => {
                let txn = self.doc.transact();
                any_to_json(&array.to_json(&txn))
            }
            Root::Text(_) => serde_json::to_value(self.text_spans())
                .unwrap_or(serde_json::Value::Array(Vec::new())),
        }
    }
}

impl std::fmt::Debug for ReplicatedDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedDoc")
            .field("room_type", &self.room_type)
            .field("client_id", &self.client_id())
            .finish()
    }
}

fn check_range(op: &str, index: u32, len: u32, current: u32) -> Result<()> {
    let end = index.saturating_add(len);
    if end > current {
        return Err(TandemError::InvalidOperation(format!(
            "{} range {}..{} out of bounds (len {})",
            op, index, end, current
        )));
    }
    Ok(())
}

fn to_attrs(attributes: &TextAttributes) -> Attrs {
    attributes
        .iter()
        .map(|(k, v)| (Arc::<str>::from(k.as_str()), json_to_any(v)))
        .collect()
}
