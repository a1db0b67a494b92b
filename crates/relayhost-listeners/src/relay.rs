//! Blob trigger relay: turns a discovered blob into a message on the host's
//! blob-trigger queue, at most once per blob revision.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relayhost_core::blob_path::BlobPathSource;
use relayhost_core::error::Result;
use relayhost_core::traits::{QueueGateway, ReceiptStore};
use relayhost_core::types::{BlobEntry, BlobPath, ChangeMarker, Lease, LeaseOutcome, ReceiptKey};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::causality;
use crate::watchers::MessageEnqueuedWatcher;

/// Name of the host-wide queue that carries blob-trigger messages.
pub fn blob_trigger_queue_name(host_id: &str) -> String {
    format!("relay-blobtrigger-{host_id}")
}

/// Payload of a blob-trigger queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub function_id: String,
    pub container: String,
    pub blob_name: String,
    pub change_marker: ChangeMarker,
    #[serde(
        rename = "$RelayParentId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_id: Option<Uuid>,
}

impl RelayMessage {
    pub fn blob_path(&self) -> BlobPath {
        BlobPath::new(&self.container, &self.blob_name)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// What happened to one discovered blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Relayed,
    AlreadyCompleted,
    /// Another worker holds the lease; the blob is not settled yet.
    AlreadyLeased,
}

impl RelayOutcome {
    /// Whether the poller may stop looking at this blob revision.
    pub fn is_settled(&self) -> bool {
        !matches!(self, RelayOutcome::AlreadyLeased)
    }
}

/// Receives blobs found by the poller for one function.
#[async_trait]
pub trait BlobDiscoveryHandler: Send + Sync {
    fn function_id(&self) -> &str;

    fn source(&self) -> &BlobPathSource;

    async fn on_discovered(&self, path: &BlobPath, entry: &BlobEntry) -> Result<RelayOutcome>;
}

#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    pub lease_duration: Duration,
    pub lease_renew_interval: Duration,
}

/// Per-function relay from blob discovery to the blob-trigger queue.
pub struct BlobTriggerRelay {
    function_id: String,
    source: BlobPathSource,
    queue: String,
    options: RelayOptions,
    receipts: Arc<dyn ReceiptStore>,
    queues: Arc<dyn QueueGateway>,
    enqueued: Option<Arc<MessageEnqueuedWatcher>>,
}

impl BlobTriggerRelay {
    pub fn new(
        function_id: impl Into<String>,
        source: BlobPathSource,
        queue: impl Into<String>,
        options: RelayOptions,
        receipts: Arc<dyn ReceiptStore>,
        queues: Arc<dyn QueueGateway>,
    ) -> Self {
        Self {
            function_id: function_id.into(),
            source,
            queue: queue.into(),
            options,
            receipts,
            queues,
            enqueued: None,
        }
    }

    /// Wake the local blob-trigger dispatcher after each relay.
    pub fn with_fast_path(mut self, watcher: Arc<MessageEnqueuedWatcher>) -> Self {
        self.enqueued = Some(watcher);
        self
    }

    async fn enqueue(&self, path: &BlobPath, entry: &BlobEntry) -> Result<()> {
        let message = RelayMessage {
            function_id: self.function_id.clone(),
            container: path.container.clone(),
            blob_name: path.name.clone(),
            change_marker: entry.change_marker.clone(),
            parent_id: causality::parent_from_metadata(&entry.metadata),
        };
        self.queues.enqueue(&self.queue, message.to_bytes()?).await?;
        if let Some(watcher) = &self.enqueued {
            watcher.notify(&self.queue);
        }
        Ok(())
    }

    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.receipts.release_lease(lease).await {
            tracing::warn!("⚠️ Failed to release lease on '{}': {e}", lease.key);
        }
    }
}

#[async_trait]
impl BlobDiscoveryHandler for BlobTriggerRelay {
    fn function_id(&self) -> &str {
        &self.function_id
    }

    fn source(&self) -> &BlobPathSource {
        &self.source
    }

    async fn on_discovered(&self, path: &BlobPath, entry: &BlobEntry) -> Result<RelayOutcome> {
        let key = ReceiptKey::new(&self.function_id, path, &entry.change_marker);
        let lease = match self
            .receipts
            .try_acquire_lease(&key, self.options.lease_duration)
            .await?
        {
            LeaseOutcome::Acquired(lease) => lease,
            LeaseOutcome::AlreadyCompleted => return Ok(RelayOutcome::AlreadyCompleted),
            LeaseOutcome::AlreadyLeased => {
                tracing::debug!("🔒 '{}' is leased by another worker", key);
                return Ok(RelayOutcome::AlreadyLeased);
            }
        };

        let renewer = LeaseRenewer::spawn(self.receipts.clone(), lease, self.options);
        let enqueued = self.enqueue(path, entry).await;
        let lease = renewer.finish().await;

        if let Err(e) = enqueued {
            self.release(&lease).await;
            return Err(e);
        }
        let completed = self.receipts.mark_completed(&lease).await;
        self.release(&lease).await;
        completed?;

        tracing::debug!("📨 Relayed '{}' for function '{}'", path, self.function_id);
        Ok(RelayOutcome::Relayed)
    }
}

/// Keeps a receipt lease alive while the relay works.
struct LeaseRenewer {
    stop: CancellationToken,
    handle: tokio::task::JoinHandle<Lease>,
    original: Lease,
}

impl LeaseRenewer {
    fn spawn(receipts: Arc<dyn ReceiptStore>, lease: Lease, options: RelayOptions) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let original = lease.clone();
        let handle = tokio::spawn(async move {
            let mut current = lease;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(options.lease_renew_interval) => {}
                }
                match receipts.renew_lease(&current, options.lease_duration).await {
                    Ok(renewed) => current = renewed,
                    Err(e) => {
                        tracing::warn!("⚠️ Lease lost on '{}': {e}", current.key);
                        break;
                    }
                }
            }
            current
        });
        Self {
            stop,
            handle,
            original,
        }
    }

    /// Stop renewing and hand back the latest lease.
    async fn finish(self) -> Lease {
        self.stop.cancel();
        self.handle.await.unwrap_or(self.original)
    }
}
