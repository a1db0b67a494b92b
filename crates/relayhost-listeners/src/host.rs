//! Relay host: wires registered functions to shared pollers, the host
//! blob-trigger queue and per-function queue dispatchers, and runs them all
//! as one composite listener.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relayhost_core::blob_path::BlobPathSource;
use relayhost_core::config::{QueueConfig, RelayHostConfig};
use relayhost_core::error::{RelayError, Result};
use relayhost_core::traits::{
    BlobGateway, ExceptionSink, FunctionExecutor, QueueGateway, ReceiptStore,
};
use tokio_util::sync::CancellationToken;

use crate::blob_queue::{BlobQueueTriggerExecutor, SharedBlobQueueListener};
use crate::composite::CompositeListener;
use crate::dispatcher::{QueueListener, QueueListenerOptions, QueueMessageHandler};
use crate::listener::Listener;
use crate::poller::{BlobChangePoller, PollerOptions};
use crate::processor::{
    BackoffPolicy, DefaultQueueProcessorFactory, ExponentialBackoff, PoisonObserver,
    QueueProcessorContext, QueueProcessorFactory, QueueProcessorOptions,
};
use crate::queue_trigger::QueueTriggerExecutor;
use crate::registry::{SharedListenerHandle, SharedListenerKey, SharedListenerRegistry};
use crate::relay::{BlobDiscoveryHandler, BlobTriggerRelay, RelayOptions, blob_trigger_queue_name};
use crate::watchers::{BlobWrittenWatcher, MessageEnqueuedWatcher};
use crate::writer::{CausalQueueWriter, HostBlobWriter};

const POLLER_RESOURCE: &str = "blob-poller";

/// Host tuning and extension points.
#[derive(Clone)]
pub struct RelayHostOptions {
    pub host_id: String,
    pub account: String,
    pub poller: PollerOptions,
    pub relay: RelayOptions,
    pub queues: QueueConfig,
    pub backoff: Arc<dyn BackoffPolicy>,
    pub processor_factory: Arc<dyn QueueProcessorFactory>,
    pub poison_observer: Option<Arc<dyn PoisonObserver>>,
}

impl RelayHostOptions {
    pub fn from_config(config: &RelayHostConfig) -> Self {
        Self {
            host_id: config.resolve_host_id(),
            account: config.account.clone(),
            poller: PollerOptions {
                poll_interval: config.blobs.poll_interval(),
                list_retry_attempts: config.blobs.list_retry_attempts,
                list_retry_base: config.blobs.list_retry_base(),
            },
            relay: RelayOptions {
                lease_duration: config.blobs.lease_duration(),
                lease_renew_interval: config.blobs.lease_renew_interval(),
            },
            queues: config.queues.clone(),
            backoff: Arc::new(ExponentialBackoff::from_config(&config.queues)),
            processor_factory: Arc::new(DefaultQueueProcessorFactory),
            poison_observer: None,
        }
    }

    fn fast_path(&self) -> bool {
        self.queues.fast_path
    }
}

/// External collaborators the host runs against.
#[derive(Clone)]
pub struct RelayHostServices {
    pub blobs: Arc<dyn BlobGateway>,
    pub queues: Arc<dyn QueueGateway>,
    pub receipts: Arc<dyn ReceiptStore>,
    pub executor: Arc<dyn FunctionExecutor>,
    pub exception_sink: Arc<dyn ExceptionSink>,
}

#[derive(Default)]
struct HostState {
    function_ids: HashSet<String>,
    listeners: Vec<Arc<dyn Listener>>,
    running: Option<Arc<CompositeListener>>,
}

pub struct RelayHost {
    options: RelayHostOptions,
    services: RelayHostServices,
    registry: Arc<SharedListenerRegistry>,
    enqueued: Arc<MessageEnqueuedWatcher>,
    blob_written: Arc<BlobWrittenWatcher>,
    state: Mutex<HostState>,
    disposed: AtomicBool,
}

impl RelayHost {
    pub fn new(options: RelayHostOptions, services: RelayHostServices) -> Self {
        Self::with_registry(options, services, Arc::new(SharedListenerRegistry::new()))
    }

    /// Host whose pollers and dispatchers are shared with every other host
    /// built on the same `registry`: one blob poller per account per process.
    pub fn with_registry(
        options: RelayHostOptions,
        services: RelayHostServices,
        registry: Arc<SharedListenerRegistry>,
    ) -> Self {
        Self {
            options,
            services,
            registry,
            enqueued: Arc::new(MessageEnqueuedWatcher::new()),
            blob_written: Arc::new(BlobWrittenWatcher::new()),
            state: Mutex::new(HostState::default()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.options.host_id
    }

    /// Queue carrying this host's blob-trigger messages.
    pub fn blob_trigger_queue(&self) -> String {
        blob_trigger_queue_name(&self.options.host_id)
    }

    pub fn registry(&self) -> &Arc<SharedListenerRegistry> {
        &self.registry
    }

    /// Run `function_id` for every new or changed blob matching `pattern`.
    pub async fn register_blob_trigger(&self, function_id: &str, pattern: &str) -> Result<()> {
        let source = BlobPathSource::parse(pattern)?;
        self.reserve(function_id)?;
        match self.attach_blob_trigger(function_id, source).await {
            Ok(listeners) => self.commit(listeners),
            Err(e) => {
                self.unreserve(function_id);
                Err(e)
            }
        }
    }

    /// Run `function_id` for every message on `queue`.
    pub async fn register_queue_trigger(&self, function_id: &str, queue: &str) -> Result<()> {
        if queue.trim().is_empty() {
            return Err(RelayError::Config(format!(
                "function '{function_id}' has an empty queue name"
            )));
        }
        self.reserve(function_id)?;
        let handler: Arc<dyn QueueMessageHandler> = Arc::new(QueueTriggerExecutor::new(
            function_id,
            queue,
            self.services.executor.clone(),
        ));
        let listener = self.queue_listener(queue, handler);
        tracing::info!("📬 Function '{}' listening on queue '{}'", function_id, queue);
        self.commit(vec![Arc::new(listener)])
    }

    /// Blob output binding for function bodies.
    pub fn blob_writer(&self) -> HostBlobWriter {
        let watcher = self.options.fast_path().then(|| self.blob_written.clone());
        HostBlobWriter::new(self.services.blobs.clone(), watcher)
    }

    /// Queue output binding for function bodies.
    pub fn queue_writer(&self) -> CausalQueueWriter {
        let watcher = self.options.fast_path().then(|| self.enqueued.clone());
        CausalQueueWriter::new(self.services.queues.clone(), watcher)
    }

    async fn attach_blob_trigger(
        &self,
        function_id: &str,
        source: BlobPathSource,
    ) -> Result<Vec<Arc<dyn Listener>>> {
        let account = &self.options.account;
        let queue = self.blob_trigger_queue();

        let poller_key = SharedListenerKey::new(account, POLLER_RESOURCE);
        let poller = self
            .registry
            .get_or_create(&poller_key, || {
                let wake = self.options.fast_path().then(|| self.blob_written.subscribe());
                Ok(Arc::new(BlobChangePoller::new(
                    account,
                    self.services.blobs.clone(),
                    self.options.poller,
                    self.services.exception_sink.clone(),
                    wake,
                )))
            })
            .await?;

        let queue_key = SharedListenerKey::new(account, &queue);
        let dispatcher = match self
            .registry
            .get_or_create(&queue_key, || {
                let executor = Arc::new(BlobQueueTriggerExecutor::new(self.services.blobs.clone()));
                let listener = self.queue_listener(&queue, executor.clone());
                Ok(Arc::new(SharedBlobQueueListener::new(executor, listener)))
            })
            .await
        {
            Ok(d) => d,
            Err(e) => {
                self.registry.release(&poller_key).await.ok();
                return Err(e);
            }
        };

        let mut relay = BlobTriggerRelay::new(
            function_id,
            source,
            queue.as_str(),
            self.options.relay,
            self.services.receipts.clone(),
            self.services.queues.clone(),
        );
        if self.options.fast_path() {
            relay = relay.with_fast_path(self.enqueued.clone());
        }
        let relay: Arc<dyn BlobDiscoveryHandler> = Arc::new(relay);
        dispatcher.register(function_id, self.services.executor.clone());
        poller.register(relay.clone());

        let id = function_id.to_string();
        let poller_handle = SharedListenerHandle::new(self.registry.clone(), poller_key, {
            let poller = poller.clone();
            move || poller.remove_handler(&relay)
        });
        let queue_handle = SharedListenerHandle::new(self.registry.clone(), queue_key, {
            let dispatcher = dispatcher.clone();
            move || dispatcher.unregister(&id)
        });
        Ok(vec![Arc::new(queue_handle), Arc::new(poller_handle)])
    }

    fn queue_listener(&self, queue: &str, handler: Arc<dyn QueueMessageHandler>) -> QueueListener {
        let processor = self.options.processor_factory.create(QueueProcessorContext {
            queues: self.services.queues.clone(),
            options: QueueProcessorOptions::from_config(queue, &self.options.queues),
            backoff: self.options.backoff.clone(),
            poison_observer: self.options.poison_observer.clone(),
        });
        let listener = QueueListener::new(
            queue,
            self.services.queues.clone(),
            processor,
            handler,
            self.services.exception_sink.clone(),
            QueueListenerOptions {
                min_poll_interval: self.options.queues.min_poll_interval(),
                max_poll_interval: self.options.queues.max_poll_interval(),
            },
        );
        if self.options.fast_path() {
            listener.with_fast_path(self.enqueued.subscribe(queue))
        } else {
            listener
        }
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, HostState>> {
        self.state
            .lock()
            .map_err(|e| RelayError::Listener(format!("host state poisoned: {e}")))
    }

    fn reserve(&self, function_id: &str) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RelayError::Disposed);
        }
        let mut state = self.lock_state()?;
        if state.running.is_some() {
            return Err(RelayError::Listener(
                "functions must be registered before the host starts".into(),
            ));
        }
        if !state.function_ids.insert(function_id.to_string()) {
            return Err(RelayError::Config(format!(
                "function '{function_id}' is already registered"
            )));
        }
        Ok(())
    }

    fn unreserve(&self, function_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.function_ids.remove(function_id);
        }
    }

    fn commit(&self, listeners: Vec<Arc<dyn Listener>>) -> Result<()> {
        self.lock_state()?.listeners.extend(listeners);
        Ok(())
    }

    fn all_listeners(&self) -> Result<Vec<Arc<dyn Listener>>> {
        Ok(self.lock_state()?.listeners.clone())
    }
}

#[async_trait]
impl Listener for RelayHost {
    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RelayError::Disposed);
        }
        let composite = {
            let mut state = self.lock_state()?;
            if state.running.is_some() {
                return Err(RelayError::Listener("host is already running".into()));
            }
            let composite = Arc::new(CompositeListener::new(state.listeners.clone()));
            state.running = Some(composite.clone());
            composite
        };

        if let Err(e) = composite.start(cancel).await {
            if let Ok(mut state) = self.state.lock() {
                state.running = None;
            }
            return Err(e);
        }
        tracing::info!(
            "🟢 Relay host '{}' started with {} listener(s)",
            self.options.host_id,
            composite.len()
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RelayError::Disposed);
        }
        let running = self.lock_state()?.running.take();
        if let Some(composite) = running {
            composite.stop().await?;
            tracing::info!("🔴 Relay host '{}' stopped", self.options.host_id);
        }
        Ok(())
    }

    fn cancel(&self) {
        let running = self.state.lock().ok().and_then(|s| s.running.clone());
        if let Some(composite) = running {
            composite.cancel();
        }
    }

    async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut state) = self.state.lock() {
            state.running = None;
        }
        // Children stop themselves on dispose.
        let all = CompositeListener::new(self.all_listeners()?);
        all.dispose().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayhost_core::traits::TracingExceptionSink;
    use relayhost_core::types::{BlobPath, FunctionResult, TriggerData, TriggerValue};
    use relayhost_storage::{MemoryBlobStore, MemoryQueueService, MemoryReceiptStore};
    use std::time::Duration;
    use uuid::Uuid;

    /// Records invocations; functions listed in `failing` always fail.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, TriggerData)>>,
        failing: Vec<String>,
    }

    impl Recorder {
        fn count(&self, function_id: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == function_id)
                .count()
        }
    }

    #[async_trait]
    impl FunctionExecutor for Recorder {
        async fn invoke(
            &self,
            function_id: &str,
            trigger: TriggerData,
            _cancel: CancellationToken,
        ) -> FunctionResult {
            self.calls.lock().unwrap().push((function_id.to_string(), trigger));
            if self.failing.iter().any(|f| f == function_id) {
                FunctionResult::Failed("boom".into())
            } else {
                FunctionResult::Succeeded
            }
        }
    }

    struct Fixture {
        blobs: Arc<MemoryBlobStore>,
        queues: Arc<MemoryQueueService>,
        receipts: Arc<MemoryReceiptStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                blobs: Arc::new(MemoryBlobStore::new()),
                queues: Arc::new(MemoryQueueService::new()),
                receipts: Arc::new(MemoryReceiptStore::new()),
            }
        }

        fn host(&self, host_id: &str, fast_path: bool, executor: Arc<Recorder>) -> RelayHost {
            self.host_in(host_id, fast_path, executor, Arc::new(SharedListenerRegistry::new()))
        }

        fn host_in(
            &self,
            host_id: &str,
            fast_path: bool,
            executor: Arc<Recorder>,
            registry: Arc<SharedListenerRegistry>,
        ) -> RelayHost {
            let mut config = RelayHostConfig {
                host_id: Some(host_id.into()),
                ..RelayHostConfig::default()
            };
            config.blobs.poll_interval_ms = 20;
            config.queues.max_dequeue_count = 3;
            config.queues.min_poll_interval_ms = 5;
            config.queues.max_poll_interval_ms = 40;
            config.queues.fast_path = fast_path;
            let mut options = RelayHostOptions::from_config(&config);
            options.backoff = Arc::new(ExponentialBackoff::new(Duration::ZERO, Duration::ZERO));

            RelayHost::with_registry(
                options,
                RelayHostServices {
                    blobs: self.blobs.clone(),
                    queues: self.queues.clone(),
                    receipts: self.receipts.clone(),
                    executor,
                    exception_sink: Arc::new(TracingExceptionSink),
                },
                registry,
            )
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while tokio::time::Instant::now() < deadline {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        done()
    }

    async fn blob_invoked_once(fast_path: bool) {
        let fx = Fixture::new();
        let recorder = Arc::new(Recorder::default());
        let host = fx.host("node-a", fast_path, recorder.clone());
        host.register_blob_trigger("F", "C/{name}").await.unwrap();
        fx.blobs.insert("C", "A", "payload").unwrap();

        host.start(CancellationToken::new()).await.unwrap();
        assert!(wait_until(|| recorder.count("F") == 1).await);

        // Several more poll cycles with no change.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(recorder.count("F"), 1);
        let calls = recorder.calls.lock().unwrap().clone();
        assert!(matches!(
            &calls[0].1.value,
            TriggerValue::Blob { path, .. } if *path == BlobPath::new("C", "A")
        ));
        assert!(fx.queues.is_empty(&host.blob_trigger_queue()));

        host.stop().await.unwrap();
        host.dispose().await.unwrap();
        assert!(host.registry().is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blob_invoked_once_with_fast_path() {
        blob_invoked_once(true).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blob_invoked_once_polling_only() {
        blob_invoked_once(false).await;
    }

    async fn failing_message_poisoned(fast_path: bool) {
        let fx = Fixture::new();
        let recorder = Arc::new(Recorder {
            failing: vec!["Q".into()],
            ..Default::default()
        });
        let host = fx.host("node-a", fast_path, recorder.clone());
        host.register_queue_trigger("Q", "jobs").await.unwrap();
        host.start(CancellationToken::new()).await.unwrap();
        host.queue_writer()
            .enqueue("jobs", br#"{"id":1}"#, None)
            .await
            .unwrap();

        assert!(wait_until(|| fx.queues.len("jobs-poison") == 1).await);
        assert_eq!(recorder.count("Q"), 3);
        assert!(fx.queues.is_empty("jobs"));
        host.dispose().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_message_poisoned_with_fast_path() {
        failing_message_poisoned(true).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_message_poisoned_polling_only() {
        failing_message_poisoned(false).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_hosts_share_receipts() {
        let fx = Fixture::new();
        let recorder = Arc::new(Recorder::default());
        let a = fx.host("node-a", false, recorder.clone());
        let b = fx.host("node-b", false, recorder.clone());
        for host in [&a, &b] {
            host.register_blob_trigger("F", "C/{name}.txt").await.unwrap();
        }
        for i in 0..5 {
            fx.blobs.insert("C", &format!("{i}.txt"), "x").unwrap();
        }
        fx.blobs.insert("C", "skip.bin", "x").unwrap();

        a.start(CancellationToken::new()).await.unwrap();
        b.start(CancellationToken::new()).await.unwrap();
        assert!(wait_until(|| recorder.count("F") == 5).await);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(recorder.count("F"), 5);

        a.dispose().await.unwrap();
        b.dispose().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hosts_in_one_process_share_a_poller() {
        let fx = Fixture::new();
        let registry = Arc::new(SharedListenerRegistry::new());
        let recorder = Arc::new(Recorder::default());
        let a = fx.host_in("node-a", false, recorder.clone(), registry.clone());
        let b = fx.host_in("node-b", false, recorder.clone(), registry.clone());
        for host in [&a, &b] {
            host.register_blob_trigger("F", "C/{name}").await.unwrap();
        }

        let poller_key = SharedListenerKey::new("default", POLLER_RESOURCE);
        assert_eq!(registry.registrations(&poller_key).await, 2);
        // One poller plus each host's blob-trigger dispatcher.
        assert_eq!(registry.len().await, 3);

        fx.blobs.insert("C", "A", "x").unwrap();
        a.start(CancellationToken::new()).await.unwrap();
        b.start(CancellationToken::new()).await.unwrap();
        assert!(wait_until(|| recorder.count("F") == 1).await);

        // Host b keeps its relay after host a leaves.
        a.dispose().await.unwrap();
        assert_eq!(registry.registrations(&poller_key).await, 1);
        fx.blobs.insert("C", "B", "y").unwrap();
        assert!(wait_until(|| recorder.count("F") == 2).await);

        b.dispose().await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parent_flows_through_queue_and_blob() {
        let fx = Fixture::new();
        let recorder = Arc::new(Recorder::default());
        let host = fx.host("node-a", true, recorder.clone());
        host.register_queue_trigger("Q", "orders").await.unwrap();
        host.register_blob_trigger("B", "out/{name}").await.unwrap();
        host.start(CancellationToken::new()).await.unwrap();

        let queue_parent = Uuid::new_v4();
        let blob_parent = Uuid::new_v4();
        host.queue_writer()
            .enqueue_json("orders", &serde_json::json!({"n": 1}), Some(queue_parent))
            .await
            .unwrap();
        host.blob_writer()
            .write(&BlobPath::new("out", "r.txt"), b"x".to_vec(), Some(blob_parent))
            .await
            .unwrap();

        assert!(wait_until(|| recorder.count("Q") == 1 && recorder.count("B") == 1).await);
        let calls = recorder.calls.lock().unwrap().clone();
        let parent_of = |id: &str| calls.iter().find(|(f, _)| f == id).and_then(|(_, t)| t.parent_id);
        assert_eq!(parent_of("Q"), Some(queue_parent));
        assert_eq!(parent_of("B"), Some(blob_parent));
        host.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_registration_rules() {
        let fx = Fixture::new();
        let host = fx.host("node-a", true, Arc::new(Recorder::default()));
        host.register_queue_trigger("F", "jobs").await.unwrap();
        assert!(matches!(
            host.register_blob_trigger("F", "c/{name}").await,
            Err(RelayError::Config(_))
        ));
        assert!(matches!(
            host.register_blob_trigger("G", "{bad}/x").await,
            Err(RelayError::InvalidPattern { .. })
        ));
        host.register_blob_trigger("G", "c/{name}").await.unwrap();

        host.start(CancellationToken::new()).await.unwrap();
        assert!(host.register_queue_trigger("H", "other").await.is_err());
        host.cancel();
        host.stop().await.unwrap();

        host.dispose().await.unwrap();
        assert!(matches!(
            host.start(CancellationToken::new()).await,
            Err(RelayError::Disposed)
        ));
        assert!(host.registry().is_empty().await);
    }
}
