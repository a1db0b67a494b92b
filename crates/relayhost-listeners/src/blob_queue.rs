//! Consumer side of the blob-trigger queue, shared by every blob-triggered
//! function on the host.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use relayhost_core::error::{RelayError, Result};
use relayhost_core::traits::{BlobGateway, FunctionExecutor};
use relayhost_core::types::{
    BlobEntry, BlobPath, FunctionResult, QueueMessage, TriggerData, TriggerValue,
};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{QueueListener, QueueMessageHandler};
use crate::listener::Listener;
use crate::relay::RelayMessage;

const PROPERTY_READ_ATTEMPTS: u32 = 3;
const PROPERTY_READ_BASE: Duration = Duration::from_millis(50);

/// Routes relay messages to the function named in them.
///
/// Before invoking it re-reads the blob: a deleted blob or a newer revision
/// makes the message obsolete, and it is settled without running anything.
pub struct BlobQueueTriggerExecutor {
    blobs: Arc<dyn BlobGateway>,
    registrations: RwLock<HashMap<String, Arc<dyn FunctionExecutor>>>,
}

impl BlobQueueTriggerExecutor {
    pub fn new(blobs: Arc<dyn BlobGateway>) -> Self {
        Self {
            blobs,
            registrations: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, function_id: &str, executor: Arc<dyn FunctionExecutor>) {
        if let Ok(mut regs) = self.registrations.write() {
            regs.insert(function_id.to_string(), executor);
        }
    }

    pub fn unregister(&self, function_id: &str) {
        if let Ok(mut regs) = self.registrations.write() {
            regs.remove(function_id);
        }
    }

    fn executor_for(&self, function_id: &str) -> Option<Arc<dyn FunctionExecutor>> {
        self.registrations
            .read()
            .ok()
            .and_then(|regs| regs.get(function_id).cloned())
    }

    /// Current blob properties, retrying transient failures a few times.
    async fn current_properties(
        &self,
        path: &BlobPath,
        cancel: &CancellationToken,
    ) -> Result<Option<BlobEntry>> {
        let mut attempt = 1;
        loop {
            match self.blobs.get_properties(&path.container, &path.name).await {
                Err(e) if e.is_transient() && attempt < PROPERTY_READ_ATTEMPTS => {
                    let delay = PROPERTY_READ_BASE * (1 << (attempt - 1));
                    tracing::debug!("🔁 Reading '{}' failed ({e}), retry in {:?}", path, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl QueueMessageHandler for BlobQueueTriggerExecutor {
    async fn handle(&self, message: &QueueMessage, cancel: CancellationToken) -> FunctionResult {
        let relay = match RelayMessage::from_bytes(&message.payload) {
            Ok(relay) => relay,
            Err(e) => return FunctionResult::Failed(format!("invalid blob trigger message: {e}")),
        };

        let Some(executor) = self.executor_for(&relay.function_id) else {
            tracing::debug!(
                "🗑️ Dropping blob trigger for unregistered function '{}'",
                relay.function_id
            );
            return FunctionResult::Succeeded;
        };

        let path = relay.blob_path();
        match self.current_properties(&path, &cancel).await {
            Ok(Some(current)) if current.change_marker == relay.change_marker => {}
            Ok(Some(_)) => {
                tracing::debug!("⏭️ '{}' changed since relay; newer revision pending", path);
                return FunctionResult::Succeeded;
            }
            Ok(None) => {
                tracing::debug!("⏭️ '{}' no longer exists", path);
                return FunctionResult::Succeeded;
            }
            Err(RelayError::Cancelled) => return FunctionResult::Cancelled,
            Err(e) if e.is_transient() => {
                return FunctionResult::Deferred(format!("reading '{path}': {e}"));
            }
            Err(e) => return FunctionResult::Failed(format!("reading '{path}': {e}")),
        }

        tracing::info!("🚀 Invoking '{}' for blob '{}'", relay.function_id, path);
        let trigger = TriggerData {
            value: TriggerValue::Blob {
                path,
                change_marker: relay.change_marker,
            },
            parent_id: relay.parent_id,
        };
        executor.invoke(&relay.function_id, trigger, cancel).await
    }
}

/// The blob-trigger queue dispatcher plus its function routing table.
pub struct SharedBlobQueueListener {
    executor: Arc<BlobQueueTriggerExecutor>,
    listener: QueueListener,
}

impl SharedBlobQueueListener {
    /// `listener` must dispatch to `executor`.
    pub fn new(executor: Arc<BlobQueueTriggerExecutor>, listener: QueueListener) -> Self {
        Self { executor, listener }
    }

    pub fn register(&self, function_id: &str, executor: Arc<dyn FunctionExecutor>) {
        self.executor.register(function_id, executor);
    }

    pub fn unregister(&self, function_id: &str) {
        self.executor.unregister(function_id);
    }

    pub fn queue(&self) -> &str {
        self.listener.queue()
    }
}

#[async_trait]
impl Listener for SharedBlobQueueListener {
    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        self.listener.start(cancel).await
    }

    async fn stop(&self) -> Result<()> {
        self.listener.stop().await
    }

    fn cancel(&self) {
        self.listener.cancel();
    }

    async fn dispose(&self) -> Result<()> {
        self.listener.dispose().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayhost_core::types::{BlobPath, ChangeMarker};
    use relayhost_storage::MemoryBlobStore;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, TriggerData)>>);

    #[async_trait]
    impl FunctionExecutor for Recorder {
        async fn invoke(
            &self,
            function_id: &str,
            trigger: TriggerData,
            _cancel: CancellationToken,
        ) -> FunctionResult {
            self.0.lock().unwrap().push((function_id.to_string(), trigger));
            FunctionResult::Succeeded
        }
    }

    fn message(relay: &RelayMessage) -> QueueMessage {
        QueueMessage {
            id: "m".into(),
            payload: relay.to_bytes().unwrap(),
            dequeue_count: 1,
            pop_receipt: "r".into(),
            inserted_at: chrono::Utc::now(),
        }
    }

    fn relay_for(marker: &ChangeMarker, parent: Option<Uuid>) -> RelayMessage {
        RelayMessage {
            function_id: "thumbs".into(),
            container: "photos".into(),
            blob_name: "a.jpg".into(),
            change_marker: marker.clone(),
            parent_id: parent,
        }
    }

    #[tokio::test]
    async fn test_invokes_current_revision_with_parent() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let entry = blobs.insert("photos", "a.jpg", "x").unwrap();
        let recorder = Arc::new(Recorder::default());
        let executor = BlobQueueTriggerExecutor::new(blobs);
        executor.register("thumbs", recorder.clone());

        let parent = Uuid::new_v4();
        let msg = message(&relay_for(&entry.change_marker, Some(parent)));
        let result = executor.handle(&msg, CancellationToken::new()).await;
        assert!(result.is_success());

        let calls = recorder.0.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "thumbs");
        assert_eq!(calls[0].1.parent_id, Some(parent));
        assert_eq!(
            calls[0].1.value,
            TriggerValue::Blob {
                path: BlobPath::new("photos", "a.jpg"),
                change_marker: entry.change_marker.clone(),
            }
        );
    }

    #[tokio::test]
    async fn test_obsolete_messages_are_settled_without_invoking() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let old = blobs.insert("photos", "a.jpg", "v1").unwrap();
        blobs.insert("photos", "a.jpg", "v2").unwrap();
        let recorder = Arc::new(Recorder::default());
        let executor = BlobQueueTriggerExecutor::new(blobs.clone());
        executor.register("thumbs", recorder.clone());

        let stale = message(&relay_for(&old.change_marker, None));
        assert!(executor.handle(&stale, CancellationToken::new()).await.is_success());

        blobs.remove("photos", "a.jpg").unwrap();
        let gone = message(&relay_for(&ChangeMarker::new("0x1"), None));
        assert!(executor.handle(&gone, CancellationToken::new()).await.is_success());

        executor.unregister("thumbs");
        assert!(executor.handle(&stale, CancellationToken::new()).await.is_success());
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_read_is_deferred_not_poisoned() {
        use crate::dispatcher::QueueListenerOptions;
        use crate::processor::{
            DefaultQueueProcessor, ExponentialBackoff, QueueProcessorContext, QueueProcessorOptions,
        };
        use relayhost_core::traits::{QueueGateway, TracingExceptionSink};
        use relayhost_storage::MemoryQueueService;

        let blobs = Arc::new(MemoryBlobStore::new());
        let entry = blobs.insert("photos", "a.jpg", "x").unwrap();
        let recorder = Arc::new(Recorder::default());
        let executor = Arc::new(BlobQueueTriggerExecutor::new(blobs.clone()));
        executor.register("thumbs", recorder.clone());

        let queues = Arc::new(MemoryQueueService::new());
        let processor = Arc::new(DefaultQueueProcessor::new(QueueProcessorContext {
            queues: queues.clone(),
            options: QueueProcessorOptions {
                queue: "blobs".into(),
                poison_queue: "blobs-poison".into(),
                batch_size: 4,
                max_dequeue_count: 1,
                visibility_timeout: Duration::from_secs(30),
            },
            backoff: Arc::new(ExponentialBackoff::new(Duration::ZERO, Duration::ZERO)),
            poison_observer: None,
        }));
        let listener = QueueListener::new(
            "blobs",
            queues.clone(),
            processor,
            executor,
            Arc::new(TracingExceptionSink),
            QueueListenerOptions {
                min_poll_interval: Duration::from_millis(5),
                max_poll_interval: Duration::from_millis(20),
            },
        );
        let relay = relay_for(&entry.change_marker, None);
        queues.enqueue("blobs", relay.to_bytes().unwrap()).await.unwrap();

        // Outlasts the in-handler retries once.
        blobs.fail_next_property_reads(PROPERTY_READ_ATTEMPTS + 1);
        let cancel = CancellationToken::new();
        assert_eq!(listener.drain_once(&cancel).await.unwrap(), 1);
        assert!(recorder.0.lock().unwrap().is_empty());
        assert_eq!(queues.len("blobs"), 1);
        assert!(queues.is_empty("blobs-poison"));

        assert_eq!(listener.drain_once(&cancel).await.unwrap(), 1);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
        assert!(queues.is_empty("blobs"));
        assert!(queues.is_empty("blobs-poison"));
    }

    #[tokio::test]
    async fn test_malformed_message_fails() {
        let executor = BlobQueueTriggerExecutor::new(Arc::new(MemoryBlobStore::new()));
        let msg = QueueMessage {
            payload: b"not json".to_vec(),
            ..message(&relay_for(&ChangeMarker::new("0x1"), None))
        };
        let result = executor.handle(&msg, CancellationToken::new()).await;
        assert!(matches!(result, FunctionResult::Failed(_)));
    }
}
