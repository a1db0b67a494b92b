//! Queue dispatcher: drains one queue in batches and settles each message
//! through its [`QueueProcessor`].
//!
//! ```text
//!   Idle ──timer / fast-path hint──► Draining ──full batch──► Draining
//!    ▲                                  │
//!    │                                  ├─ partial batch ─► Idle (min interval)
//!    └──────── message found ───────────┴─ empty batch ───► Backoff (interval × 2, capped)
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use relayhost_core::error::{RelayError, Result};
use relayhost_core::traits::{ExceptionSink, QueueGateway};
use relayhost_core::types::{FunctionResult, QueueMessage};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::listener::{BackgroundLoop, Listener, ListenerState};
use crate::processor::QueueProcessor;

/// Runs the bound function(s) for one dequeued message.
#[async_trait]
pub trait QueueMessageHandler: Send + Sync {
    async fn handle(&self, message: &QueueMessage, cancel: CancellationToken) -> FunctionResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Draining,
    Backoff,
}

/// Poll-interval bookkeeping for the dispatch loop.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl PollSchedule {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Next state and wait after a batch of `found` messages.
    pub fn after_batch(&mut self, found: usize, batch_size: usize) -> (DispatchState, Duration) {
        if found > 0 && found >= batch_size {
            self.current = self.min;
            (DispatchState::Draining, Duration::ZERO)
        } else if found > 0 {
            self.current = self.min;
            (DispatchState::Idle, self.min)
        } else {
            self.backoff()
        }
    }

    /// Treat a failed dequeue like an empty queue.
    pub fn after_error(&mut self) -> (DispatchState, Duration) {
        self.backoff()
    }

    fn backoff(&mut self) -> (DispatchState, Duration) {
        let wait = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        (DispatchState::Backoff, wait)
    }
}

#[derive(Debug, Clone)]
pub struct QueueListenerOptions {
    pub min_poll_interval: Duration,
    pub max_poll_interval: Duration,
}

struct DispatcherInner {
    queue: String,
    queues: Arc<dyn QueueGateway>,
    processor: Arc<dyn QueueProcessor>,
    handler: Arc<dyn QueueMessageHandler>,
    exception_sink: Arc<dyn ExceptionSink>,
    options: QueueListenerOptions,
    fast_path: Option<Arc<Notify>>,
}

/// Listener that polls one queue.
pub struct QueueListener {
    inner: Arc<DispatcherInner>,
    bg: BackgroundLoop,
}

impl QueueListener {
    pub fn new(
        queue: impl Into<String>,
        queues: Arc<dyn QueueGateway>,
        processor: Arc<dyn QueueProcessor>,
        handler: Arc<dyn QueueMessageHandler>,
        exception_sink: Arc<dyn ExceptionSink>,
        options: QueueListenerOptions,
    ) -> Self {
        let queue = queue.into();
        Self {
            bg: BackgroundLoop::new(format!("Queue listener '{queue}'")),
            inner: Arc::new(DispatcherInner {
                queue,
                queues,
                processor,
                handler,
                exception_sink,
                options,
                fast_path: None,
            }),
        }
    }

    /// Wake on in-process enqueue hints as well as the timer.
    pub fn with_fast_path(mut self, notify: Arc<Notify>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.fast_path = Some(notify);
        }
        self
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn state(&self) -> ListenerState {
        self.bg.state()
    }

    /// A message was just enqueued in this process; drain now.
    pub fn notify_enqueued(&self) {
        if let Some(notify) = &self.inner.fast_path {
            notify.notify_one();
        }
    }

    /// One dequeue-and-process pass; returns the number of messages handled.
    pub async fn drain_once(&self, cancel: &CancellationToken) -> Result<usize> {
        self.inner.drain_once(cancel).await
    }
}

impl DispatcherInner {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut schedule = PollSchedule::new(
            self.options.min_poll_interval,
            self.options.max_poll_interval,
        );
        let mut wait = Duration::ZERO;

        loop {
            if !wait.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                    _ = wait_for_hint(self.fast_path.as_deref()) => {
                        tracing::debug!("⚡ Queue '{}' woken by fast path", self.queue);
                    }
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            let (state, next) = match self.drain_once(&cancel).await {
                Ok(found) => schedule.after_batch(found, self.processor.batch_size()),
                Err(e) => {
                    self.report("dequeue", &e);
                    schedule.after_error()
                }
            };
            if state == DispatchState::Backoff {
                tracing::trace!("💤 Queue '{}' idle, next poll in {:?}", self.queue, next);
            }
            wait = next;
        }
    }

    async fn drain_once(&self, cancel: &CancellationToken) -> Result<usize> {
        if cancel.is_cancelled() {
            return Ok(0);
        }
        let batch = self
            .queues
            .dequeue_batch(
                &self.queue,
                self.processor.batch_size(),
                self.processor.visibility_timeout(),
            )
            .await?;
        let found = batch.len();
        if found > 0 {
            tracing::debug!("📥 Queue '{}' dequeued {} message(s)", self.queue, found);
        }
        join_all(batch.iter().map(|m| self.process(m, cancel))).await;
        Ok(found)
    }

    async fn process(&self, message: &QueueMessage, cancel: &CancellationToken) {
        // Shutdown after dequeue: hand the message back untouched.
        if cancel.is_cancelled() {
            self.complete(message, &FunctionResult::Cancelled).await;
            return;
        }
        match self.processor.begin_processing(message).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                self.report("begin processing", &e);
                return;
            }
        }

        let timeout = self.processor.visibility_timeout();
        let renewer = (!timeout.is_zero()).then(|| {
            VisibilityRenewer::spawn(self.queues.clone(), self.queue.clone(), message.clone(), timeout)
        });
        let result = self.handler.handle(message, cancel.clone()).await;
        let current = match renewer {
            Some(renewer) => renewer.finish().await,
            None => message.clone(),
        };
        self.complete(&current, &result).await;
    }

    async fn complete(&self, message: &QueueMessage, result: &FunctionResult) {
        if let Err(e) = self.processor.complete_processing(message, result).await {
            self.report("complete processing", &e);
        }
    }

    fn report(&self, stage: &str, error: &RelayError) {
        match error {
            e if e.is_transient() => {
                tracing::warn!("⚠️ Queue '{}' {} failed, will retry: {}", self.queue, stage, e);
            }
            // Visibility expired and someone else owns the message now.
            RelayError::MessageNotFound(_) | RelayError::PopReceiptMismatch(_) => {
                tracing::warn!("⚠️ Queue '{}' {}: {}", self.queue, stage, error);
            }
            _ => self
                .exception_sink
                .report(&format!("queue listener '{}' ({stage})", self.queue), error),
        }
    }
}

/// Keeps an in-flight message hidden while its function runs, re-arming the
/// visibility timeout at half its length. Each renewal rotates the pop receipt.
struct VisibilityRenewer {
    stop: CancellationToken,
    handle: tokio::task::JoinHandle<QueueMessage>,
    original: QueueMessage,
}

impl VisibilityRenewer {
    fn spawn(
        queues: Arc<dyn QueueGateway>,
        queue: String,
        message: QueueMessage,
        timeout: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let original = message.clone();
        let interval = timeout / 2;
        let handle = tokio::spawn(async move {
            let mut current = message;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match queues.update_visibility(&queue, &current, timeout).await {
                    Ok(receipt) => current.pop_receipt = receipt,
                    Err(e) if e.is_transient() => {
                        tracing::warn!("⚠️ Renewing '{}' on '{}' failed, will retry: {e}", current.id, queue);
                    }
                    Err(e) => {
                        tracing::warn!("⚠️ Lost hold on message '{}' on '{}': {e}", current.id, queue);
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

    /// Stop renewing and hand back the message with its latest pop receipt.
    async fn finish(self) -> QueueMessage {
        self.stop.cancel();
        self.handle.await.unwrap_or(self.original)
    }
}

async fn wait_for_hint(notify: Option<&Notify>) {
    match notify {
        Some(n) => n.notified().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Listener for QueueListener {
    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let inner = self.inner.clone();
        self.bg.start(&cancel, move |token| inner.run(token))
    }

    async fn stop(&self) -> Result<()> {
        self.bg.stop().await
    }

    fn cancel(&self) {
        self.bg.cancel();
    }

    async fn dispose(&self) -> Result<()> {
        self.bg.dispose().await
    }
}
