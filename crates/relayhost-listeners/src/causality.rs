//! Parent-invocation tracking across chained triggers.
//!
//! Queue payloads that are JSON objects carry the id of the invocation that
//! wrote them in [`PARENT_FIELD`]. Blobs carry it in metadata under the same
//! name. Reading is best-effort: anything malformed means "no parent".

use std::collections::BTreeMap;

use serde_json::Value;
use uuid::Uuid;

/// Correlation field name in queue payloads and blob metadata.
pub const PARENT_FIELD: &str = "$RelayParentId";

/// Write `parent` into a JSON object. Non-objects and the nil id are left
/// untouched; returns whether the payload was stamped.
pub fn stamp_parent(payload: &mut Value, parent: Uuid) -> bool {
    if parent.is_nil() {
        return false;
    }
    match payload.as_object_mut() {
        Some(obj) => {
            obj.insert(PARENT_FIELD.to_string(), Value::String(parent.to_string()));
            true
        }
        None => false,
    }
}

/// Byte-level [`stamp_parent`]. Payloads that are not a JSON object are
/// returned unchanged.
pub fn stamp_parent_bytes(payload: &[u8], parent: Uuid) -> Vec<u8> {
    let Ok(mut value) = serde_json::from_slice::<Value>(payload) else {
        return payload.to_vec();
    };
    if !stamp_parent(&mut value, parent) {
        return payload.to_vec();
    }
    serde_json::to_vec(&value).unwrap_or_else(|_| payload.to_vec())
}

/// Parent id from a queue payload, if present and well formed.
pub fn extract_parent(payload: &[u8]) -> Option<Uuid> {
    let text = std::str::from_utf8(payload).ok()?;
    let value: Value = serde_json::from_str(text).ok()?;
    parse_parent(value.as_object()?.get(PARENT_FIELD)?.as_str()?)
}

/// Record `parent` in blob metadata.
pub fn stamp_metadata(metadata: &mut BTreeMap<String, String>, parent: Uuid) {
    if !parent.is_nil() {
        metadata.insert(PARENT_FIELD.to_string(), parent.to_string());
    }
}

/// Parent id from blob metadata.
pub fn parent_from_metadata(metadata: &BTreeMap<String, String>) -> Option<Uuid> {
    parse_parent(metadata.get(PARENT_FIELD)?)
}

fn parse_parent(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw).ok().filter(|id| !id.is_nil())
}
