//! In-process fast-path hints.
//!
//! Writers inside this process tell the listeners that something just changed
//! so they can skip the rest of their poll wait. Hints are latency-only: a lost
//! hint costs at most one poll interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use relayhost_core::types::BlobPath;
use tokio::sync::Notify;

/// Per-queue wake-ups for dispatchers.
#[derive(Default)]
pub struct MessageEnqueuedWatcher {
    queues: Mutex<HashMap<String, Arc<Notify>>>,
}

impl MessageEnqueuedWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The notifier a dispatcher for `queue` waits on.
    pub fn subscribe(&self, queue: &str) -> Arc<Notify> {
        match self.queues.lock() {
            Ok(mut queues) => queues.entry(queue.to_string()).or_default().clone(),
            // Unshared notifier: the dispatcher falls back to polling.
            Err(_) => Arc::new(Notify::new()),
        }
    }

    /// A message was just enqueued on `queue`.
    pub fn notify(&self, queue: &str) {
        let notifier = self.queues.lock().ok().and_then(|q| q.get(queue).cloned());
        if let Some(notifier) = notifier {
            tracing::debug!("⚡ Fast-path wake for queue '{}'", queue);
            notifier.notify_one();
        }
    }
}

/// Wake-ups for the blob change poller.
#[derive(Default)]
pub struct BlobWrittenWatcher {
    notifier: Arc<Notify>,
}

impl BlobWrittenWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Arc<Notify> {
        self.notifier.clone()
    }

    /// A blob was just written by this process.
    pub fn notify(&self, path: &BlobPath) {
        tracing::debug!("⚡ Fast-path wake for blob '{}'", path);
        self.notifier.notify_one();
    }
}
