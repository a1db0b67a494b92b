//! Shared-listener registry.
//!
//! One poller per storage account and one dispatcher per blob-trigger queue
//! serve every function registered against them. The registry owns those
//! shared listeners, counts registrations and running handles, and tears a
//! listener down when its last registration is released. All bookkeeping
//! happens under a single async mutex.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use relayhost_core::error::{RelayError, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::listener::Listener;

/// `(storage account, resource)` identity of a shared listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharedListenerKey {
    pub account: String,
    pub resource: String,
}

impl SharedListenerKey {
    pub fn new(account: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for SharedListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account, self.resource)
    }
}

struct SharedEntry {
    /// Same object as `listener`, kept for typed access.
    typed: Arc<dyn Any + Send + Sync>,
    listener: Arc<dyn Listener>,
    registrations: usize,
    running: usize,
}

/// Process-wide (host-scoped) registry of shared listeners.
#[derive(Default)]
pub struct SharedListenerRegistry {
    entries: Mutex<HashMap<SharedListenerKey, SharedEntry>>,
}

impl SharedListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the listener for `key`, creating it with `factory` on first use.
    /// Each call counts as one registration to be matched by [`Self::release`].
    pub async fn get_or_create<T, F>(&self, key: &SharedListenerKey, factory: F) -> Result<Arc<T>>
    where
        T: Listener + 'static,
        F: FnOnce() -> Result<Arc<T>>,
    {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            let typed = entry.typed.clone().downcast::<T>().map_err(|_| {
                RelayError::Listener(format!("shared listener '{key}' has a different type"))
            })?;
            entry.registrations += 1;
            return Ok(typed);
        }

        let listener = factory()?;
        entries.insert(
            key.clone(),
            SharedEntry {
                typed: listener.clone(),
                listener: listener.clone(),
                registrations: 1,
                running: 0,
            },
        );
        tracing::debug!("🔗 Shared listener '{}' created", key);
        Ok(listener)
    }

    /// Start the shared listener if this is its first running handle.
    pub async fn start(&self, key: &SharedListenerKey, cancel: CancellationToken) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(key).ok_or_else(|| unknown(key))?;
        if entry.running == 0 {
            entry.listener.start(cancel).await?;
        }
        entry.running += 1;
        Ok(())
    }

    /// Stop the shared listener once its last running handle stops.
    pub async fn stop(&self, key: &SharedListenerKey) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(key).ok_or_else(|| unknown(key))?;
        if entry.running == 0 {
            return Ok(());
        }
        entry.running -= 1;
        if entry.running == 0 {
            entry.listener.stop().await?;
        }
        Ok(())
    }

    /// Drop one registration; the last one disposes the listener.
    pub async fn release(&self, key: &SharedListenerKey) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(key) else {
            return Ok(());
        };
        entry.registrations = entry.registrations.saturating_sub(1);
        if entry.registrations > 0 {
            return Ok(());
        }
        if let Some(entry) = entries.remove(key) {
            tracing::debug!("🔗 Shared listener '{}' released", key);
            entry.listener.dispose().await?;
        }
        Ok(())
    }

    /// Registration count for `key`, zero if absent.
    pub async fn registrations(&self, key: &SharedListenerKey) -> usize {
        self.entries
            .lock()
            .await
            .get(key)
            .map_or(0, |e| e.registrations)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

fn unknown(key: &SharedListenerKey) -> RelayError {
    RelayError::Listener(format!("no shared listener registered for '{key}'"))
}

type Detach = Box<dyn FnOnce() + Send>;

/// One function's view of a shared listener.
///
/// Start/stop are reference counted through the registry. Dispose detaches
/// the function from the shared listener and releases the registration.
/// `cancel` is a no-op: the shared listener follows the host token it was
/// started with, so one function cannot cancel it for the others.
pub struct SharedListenerHandle {
    registry: Arc<SharedListenerRegistry>,
    key: SharedListenerKey,
    started: AtomicBool,
    disposed: AtomicBool,
    detach: std::sync::Mutex<Option<Detach>>,
}

impl SharedListenerHandle {
    pub fn new(
        registry: Arc<SharedListenerRegistry>,
        key: SharedListenerKey,
        detach: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            registry,
            key,
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            detach: std::sync::Mutex::new(Some(Box::new(detach))),
        }
    }

    pub fn key(&self) -> &SharedListenerKey {
        &self.key
    }
}

#[async_trait]
impl Listener for SharedListenerHandle {
    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RelayError::Disposed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.registry.start(&self.key, cancel).await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RelayError::Disposed);
        }
        if self.started.swap(false, Ordering::SeqCst) {
            self.registry.stop(&self.key).await?;
        }
        Ok(())
    }

    fn cancel(&self) {}

    async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.started.swap(false, Ordering::SeqCst) {
            self.registry.stop(&self.key).await?;
        }
        let detach = self.detach.lock().ok().and_then(|mut d| d.take());
        if let Some(detach) = detach {
            detach();
        }
        self.registry.release(&self.key).await
    }
}
