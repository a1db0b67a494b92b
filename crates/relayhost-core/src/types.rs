//! Data model shared by the poller, relay and dispatcher.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A concrete blob location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobPath {
    pub container: String,
    pub name: String,
}

impl BlobPath {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

/// Opaque storage-supplied version token (an ETag). Compared, never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeMarker(String);

impl ChangeMarker {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub name: String,
    pub change_marker: ChangeMarker,
    /// User metadata stored with the blob (causality stamps live here).
    pub metadata: BTreeMap<String, String>,
}

impl BlobEntry {
    pub fn new(name: impl Into<String>, change_marker: ChangeMarker) -> Self {
        Self {
            name: name.into(),
            change_marker,
            metadata: BTreeMap::new(),
        }
    }
}

/// A page of a container listing.
#[derive(Debug, Clone, Default)]
pub struct BlobListing {
    pub entries: Vec<BlobEntry>,
    /// Continuation token, `None` on the last page.
    pub next_page: Option<String>,
}

/// Idempotency ledger key.
///
/// Scoped to one blob revision: an updated blob carries a new change marker and
/// therefore a fresh receipt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReceiptKey {
    pub function_id: String,
    pub container: String,
    pub blob_name: String,
    pub change_marker: ChangeMarker,
}

impl ReceiptKey {
    pub fn new(function_id: &str, path: &BlobPath, change_marker: &ChangeMarker) -> Self {
        Self {
            function_id: function_id.to_string(),
            container: path.container.clone(),
            blob_name: path.name.clone(),
            change_marker: change_marker.clone(),
        }
    }
}

impl fmt::Display for ReceiptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.function_id, self.container, self.blob_name, self.change_marker
        )
    }
}

/// A live, time-bounded claim on a receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: ReceiptKey,
    /// Owner token; only the holder of this token may renew, complete or release.
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of a lease attempt. Contention is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired(Lease),
    AlreadyLeased,
    AlreadyCompleted,
}

/// An in-flight dequeued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub payload: Vec<u8>,
    /// Incremented by the store on every delivery.
    pub dequeue_count: u32,
    /// Required to delete or update visibility; invalidated by redelivery.
    pub pop_receipt: String,
    pub inserted_at: DateTime<Utc>,
}

impl QueueMessage {
    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// What fired a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerValue {
    Blob {
        path: BlobPath,
        change_marker: ChangeMarker,
    },
    Queue {
        queue: String,
        message: QueueMessage,
    },
}

/// Trigger value plus the invocation that caused it, if known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerData {
    pub value: TriggerValue,
    pub parent_id: Option<Uuid>,
}

/// Outcome of one function invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionResult {
    Succeeded,
    Failed(String),
    /// The function observed cancellation and stopped. Not counted as a failure.
    Cancelled,
    /// The trigger could not be evaluated because a store was briefly
    /// unavailable. The message is put back with a fresh delivery count.
    Deferred(String),
}

impl FunctionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FunctionResult::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_key_scoped_to_marker() {
        let path = BlobPath::new("images", "cat.png");
        let a = ReceiptKey::new("resize", &path, &ChangeMarker::new("0x1"));
        let b = ReceiptKey::new("resize", &path, &ChangeMarker::new("0x2"));
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "resize/images/cat.png@0x1");
    }

    #[test]
    fn test_payload_str() {
        let mut msg = QueueMessage {
            id: "m1".into(),
            payload: b"hello".to_vec(),
            dequeue_count: 1,
            pop_receipt: "r".into(),
            inserted_at: Utc::now(),
        };
        assert_eq!(msg.payload_str(), Some("hello"));
        msg.payload = vec![0x00, 0xFF];
        assert_eq!(msg.payload_str(), None);
    }
}
