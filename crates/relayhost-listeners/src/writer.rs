//! Output bindings for function bodies: queue and blob writes that carry the
//! writer's invocation id and wake local listeners.

use std::collections::BTreeMap;
use std::sync::Arc;

use relayhost_core::error::Result;
use relayhost_core::traits::{BlobGateway, QueueGateway};
use relayhost_core::types::{BlobEntry, BlobPath};
use uuid::Uuid;

use crate::causality;
use crate::watchers::{BlobWrittenWatcher, MessageEnqueuedWatcher};

/// Enqueues on behalf of a running function.
#[derive(Clone)]
pub struct CausalQueueWriter {
    queues: Arc<dyn QueueGateway>,
    watcher: Option<Arc<MessageEnqueuedWatcher>>,
}

impl CausalQueueWriter {
    pub fn new(queues: Arc<dyn QueueGateway>, watcher: Option<Arc<MessageEnqueuedWatcher>>) -> Self {
        Self { queues, watcher }
    }

    /// Enqueue `payload`, stamping `parent` into it when it is a JSON object.
    /// Returns the message id.
    pub async fn enqueue(&self, queue: &str, payload: &[u8], parent: Option<Uuid>) -> Result<String> {
        let body = match parent {
            Some(id) => causality::stamp_parent_bytes(payload, id),
            None => payload.to_vec(),
        };
        let id = self.queues.enqueue(queue, body).await?;
        if let Some(watcher) = &self.watcher {
            watcher.notify(queue);
        }
        Ok(id)
    }

    pub async fn enqueue_json(
        &self,
        queue: &str,
        value: &serde_json::Value,
        parent: Option<Uuid>,
    ) -> Result<String> {
        self.enqueue(queue, &serde_json::to_vec(value)?, parent).await
    }
}

/// Writes blobs on behalf of a running function.
#[derive(Clone)]
pub struct HostBlobWriter {
    blobs: Arc<dyn BlobGateway>,
    watcher: Option<Arc<BlobWrittenWatcher>>,
}

impl HostBlobWriter {
    pub fn new(blobs: Arc<dyn BlobGateway>, watcher: Option<Arc<BlobWrittenWatcher>>) -> Self {
        Self { blobs, watcher }
    }

    /// Write a blob, recording `parent` in its metadata.
    pub async fn write(&self, path: &BlobPath, data: Vec<u8>, parent: Option<Uuid>) -> Result<BlobEntry> {
        let mut metadata = BTreeMap::new();
        if let Some(id) = parent {
            causality::stamp_metadata(&mut metadata, id);
        }
        let entry = self
            .blobs
            .put_blob(&path.container, &path.name, data, metadata)
            .await?;
        if let Some(watcher) = &self.watcher {
            watcher.notify(path);
        }
        Ok(entry)
    }
}
