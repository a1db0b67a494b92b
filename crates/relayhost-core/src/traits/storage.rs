//! Storage collaborator traits: blobs, queues and the receipt ledger.
//!
//! Implementations must be safe to share between many listeners and must
//! report timeouts/throttling as [`RelayError::Transient`](crate::RelayError).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{BlobEntry, BlobListing, Lease, LeaseOutcome, QueueMessage, ReceiptKey};

/// Blob storage gateway.
#[async_trait]
pub trait BlobGateway: Send + Sync {
    /// List one page of a container. A missing container lists as empty.
    async fn list_blobs(&self, container: &str, page_token: Option<&str>) -> Result<BlobListing>;

    /// Current properties of one blob, `None` if it does not exist.
    async fn get_properties(&self, container: &str, name: &str) -> Result<Option<BlobEntry>>;

    /// Blob content, `None` if it does not exist.
    async fn get_blob(&self, container: &str, name: &str) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite a blob; returns its new properties.
    async fn put_blob(
        &self,
        container: &str,
        name: &str,
        data: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<BlobEntry>;
}

/// Durable queue gateway with visibility-timeout semantics.
#[async_trait]
pub trait QueueGateway: Send + Sync {
    /// Append a message; returns its id.
    async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<String>;

    /// Receive up to `max` visible messages, hiding each for `visibility_timeout`
    /// and incrementing its dequeue count.
    async fn dequeue_batch(
        &self,
        queue: &str,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>>;

    /// Delete a dequeued message. Consumes its pop receipt.
    async fn delete(&self, queue: &str, message: &QueueMessage) -> Result<()>;

    /// Hide a dequeued message for `timeout` from now; returns the new pop receipt.
    async fn update_visibility(
        &self,
        queue: &str,
        message: &QueueMessage,
        timeout: Duration,
    ) -> Result<String>;
}

/// Durable idempotency ledger with per-key leases.
///
/// At most one live lease exists per key; `completed` never goes back to false.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Create the receipt if missing, then try to lease it.
    async fn try_acquire_lease(&self, key: &ReceiptKey, duration: Duration) -> Result<LeaseOutcome>;

    /// Extend a held lease. Fails with `LeaseLost` if it expired and was taken.
    async fn renew_lease(&self, lease: &Lease, duration: Duration) -> Result<Lease>;

    /// Mark the receipt completed. Completing an already-completed receipt succeeds.
    async fn mark_completed(&self, lease: &Lease) -> Result<()>;

    /// Drop a held lease. Releasing a lease that is no longer held is a no-op.
    async fn release_lease(&self, lease: &Lease) -> Result<()>;

    /// Whether the receipt exists and is completed.
    async fn is_completed(&self, key: &ReceiptKey) -> Result<bool>;
}
