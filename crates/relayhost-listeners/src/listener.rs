//! Listener lifecycle: the uniform start/stop/cancel/dispose surface shared by
//! pollers, dispatchers, registry handles and composites.

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use relayhost_core::error::{RelayError, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Anything with a background lifecycle.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Begin work. `cancel` is the host-wide shutdown signal; the listener
    /// stops taking new work once it fires.
    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    /// Stop taking new work and wait for in-flight work to finish.
    async fn stop(&self) -> Result<()>;

    /// Signal shutdown without waiting.
    fn cancel(&self);

    /// Stop and release resources. Idempotent; later calls to `start`/`stop`
    /// fail with [`RelayError::Disposed`].
    async fn dispose(&self) -> Result<()>;
}

/// Lifecycle state, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Running,
    Disposed,
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerState::Idle => write!(f, "idle"),
            ListenerState::Running => write!(f, "running"),
            ListenerState::Disposed => write!(f, "disposed"),
        }
    }
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// One spawned loop per listener, with a cancellable child token.
///
/// The lock only guards the handle; the loop is always awaited outside it.
pub(crate) struct BackgroundLoop {
    name: String,
    running: Mutex<Option<Running>>,
    disposed: AtomicBool,
}

impl BackgroundLoop {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> ListenerState {
        if self.disposed.load(Ordering::SeqCst) {
            return ListenerState::Disposed;
        }
        match self.running.lock() {
            Ok(guard) if guard.is_some() => ListenerState::Running,
            _ => ListenerState::Idle,
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(RelayError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Spawn `body` with a token derived from `parent`.
    pub(crate) fn start<F, Fut>(&self, parent: &CancellationToken, body: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ensure_live()?;
        let mut running = self
            .running
            .lock()
            .map_err(|e| RelayError::Listener(format!("{} lock poisoned: {e}", self.name)))?;
        if running.is_some() {
            return Err(RelayError::Listener(format!("{} is already running", self.name)));
        }
        let token = parent.child_token();
        let handle = tokio::spawn(body(token.clone()));
        *running = Some(Running { token, handle });
        tracing::info!("▶️ {} started", self.name);
        Ok(())
    }

    /// Cancel the loop and wait for it. Stopping an idle loop is a no-op.
    pub(crate) async fn stop(&self) -> Result<()> {
        self.ensure_live()?;
        self.shutdown().await
    }

    pub(crate) fn cancel(&self) {
        if let Ok(running) = self.running.lock() {
            if let Some(r) = running.as_ref() {
                r.token.cancel();
            }
        }
    }

    pub(crate) async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown().await
    }

    async fn shutdown(&self) -> Result<()> {
        let taken = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(e) => return Err(RelayError::Listener(format!("{} lock poisoned: {e}", self.name))),
        };
        let Some(Running { token, handle }) = taken else {
            return Ok(());
        };
        token.cancel();
        handle
            .await
            .map_err(|e| RelayError::Listener(format!("{} loop failed: {e}", self.name)))?;
        tracing::info!("⏹️ {} stopped", self.name);
        Ok(())
    }
}
