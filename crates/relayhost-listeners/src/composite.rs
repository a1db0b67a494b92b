//! Composite listener: many children, one lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use relayhost_core::error::{RelayError, Result};
use tokio_util::sync::CancellationToken;

use crate::listener::Listener;

/// Runs `start`/`stop` on every child concurrently and waits for all of them.
///
/// The first error is returned, but only after every child has finished. A
/// failed `start` stops the children that did start, so nothing is left
/// running behind an error.
pub struct CompositeListener {
    children: Vec<Arc<dyn Listener>>,
    disposed: AtomicBool,
}

impl CompositeListener {
    pub fn new(children: Vec<Arc<dyn Listener>>) -> Self {
        Self {
            children,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(RelayError::Disposed)
        } else {
            Ok(())
        }
    }
}

fn first_error(results: Vec<Result<()>>) -> Result<()> {
    results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
}

#[async_trait]
impl Listener for CompositeListener {
    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        self.ensure_live()?;
        let results = join_all(self.children.iter().map(|c| c.start(cancel.clone()))).await;
        if results.iter().all(Result::is_ok) {
            return Ok(());
        }

        let started: Vec<_> = self
            .children
            .iter()
            .zip(&results)
            .filter(|(_, r)| r.is_ok())
            .map(|(c, _)| c.clone())
            .collect();
        tracing::warn!(
            "⚠️ Composite start failed; stopping {} started listener(s)",
            started.len()
        );
        for result in join_all(started.iter().map(|c| c.stop())).await {
            if let Err(e) = result {
                tracing::warn!("⚠️ Rollback stop failed: {e}");
            }
        }
        first_error(results)
    }

    async fn stop(&self) -> Result<()> {
        self.ensure_live()?;
        first_error(join_all(self.children.iter().map(|c| c.stop())).await)
    }

    fn cancel(&self) {
        for child in &self.children {
            child.cancel();
        }
    }

    async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        first_error(join_all(self.children.iter().map(|c| c.dispose())).await)
    }
}
