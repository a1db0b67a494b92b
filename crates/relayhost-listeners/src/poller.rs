//! Blob change poller: one per storage account, shared by every
//! blob-triggered function.
//!
//! Each tick lists the registered containers and hands blobs whose change
//! marker differs from the last one seen to the matching functions. The
//! last-seen cache only saves receipt round trips; duplicate protection lives
//! in the receipt store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use relayhost_core::error::{RelayError, Result};
use relayhost_core::traits::{BlobGateway, ExceptionSink};
use relayhost_core::types::{BlobEntry, BlobPath, ChangeMarker};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::listener::{BackgroundLoop, Listener, ListenerState};
use crate::relay::{BlobDiscoveryHandler, RelayOutcome};

#[derive(Debug, Clone, Copy)]
pub struct PollerOptions {
    pub poll_interval: Duration,
    /// Attempts per listing page, including the first.
    pub list_retry_attempts: u32,
    pub list_retry_base: Duration,
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub containers: usize,
    pub listed: usize,
    pub discovered: usize,
    pub relayed: usize,
    pub failures: usize,
}

type Handlers = Vec<Arc<dyn BlobDiscoveryHandler>>;

struct PollerInner {
    account: String,
    blobs: Arc<dyn BlobGateway>,
    options: PollerOptions,
    exception_sink: Arc<dyn ExceptionSink>,
    registrations: RwLock<HashMap<String, Handlers>>,
    last_seen: Mutex<HashMap<BlobPath, ChangeMarker>>,
    wake: Option<Arc<Notify>>,
}

pub struct BlobChangePoller {
    inner: Arc<PollerInner>,
    bg: BackgroundLoop,
}

impl BlobChangePoller {
    pub fn new(
        account: impl Into<String>,
        blobs: Arc<dyn BlobGateway>,
        options: PollerOptions,
        exception_sink: Arc<dyn ExceptionSink>,
        wake: Option<Arc<Notify>>,
    ) -> Self {
        let account = account.into();
        Self {
            bg: BackgroundLoop::new(format!("Blob poller '{account}'")),
            inner: Arc::new(PollerInner {
                account,
                blobs,
                options,
                exception_sink,
                registrations: RwLock::new(HashMap::new()),
                last_seen: Mutex::new(HashMap::new()),
                wake,
            }),
        }
    }

    /// Watch `handler.source()`'s container for `handler`.
    ///
    /// Forgets what was seen in that container so the new function gets to
    /// see existing blobs; the receipt store keeps the others from re-relaying.
    pub fn register(&self, handler: Arc<dyn BlobDiscoveryHandler>) {
        let container = handler.source().container().to_string();
        tracing::info!(
            "👀 Function '{}' watching '{}' on account '{}'",
            handler.function_id(),
            handler.source(),
            self.inner.account
        );
        if let Ok(mut regs) = self.inner.registrations.write() {
            regs.entry(container.clone()).or_default().push(handler);
        }
        if let Ok(mut seen) = self.inner.last_seen.lock() {
            seen.retain(|path, _| path.container != container);
        }
    }

    pub fn unregister(&self, function_id: &str) {
        if let Ok(mut regs) = self.inner.registrations.write() {
            for handlers in regs.values_mut() {
                handlers.retain(|h| h.function_id() != function_id);
            }
            regs.retain(|_, handlers| !handlers.is_empty());
        }
    }

    /// Remove one handler instance, leaving other registrations of the same
    /// function id (from other hosts sharing this poller) in place.
    pub fn remove_handler(&self, handler: &Arc<dyn BlobDiscoveryHandler>) {
        if let Ok(mut regs) = self.inner.registrations.write() {
            for handlers in regs.values_mut() {
                handlers.retain(|h| !std::ptr::addr_eq(Arc::as_ptr(h), Arc::as_ptr(handler)));
            }
            regs.retain(|_, handlers| !handlers.is_empty());
        }
    }

    pub fn containers(&self) -> Vec<String> {
        self.inner.containers()
    }

    pub fn state(&self) -> ListenerState {
        self.bg.state()
    }

    /// Run a single scan of every registered container.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> PollStats {
        self.inner.poll_once(cancel).await
    }
}

impl PollerInner {
    fn containers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registrations
            .read()
            .map(|regs| regs.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn handlers_for(&self, path: &BlobPath) -> Handlers {
        self.registrations
            .read()
            .ok()
            .and_then(|regs| {
                regs.get(&path.container).map(|hs| {
                    hs.iter()
                        .filter(|h| h.source().is_match(path))
                        .cloned()
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    fn already_seen(&self, path: &BlobPath, marker: &ChangeMarker) -> bool {
        self.last_seen
            .lock()
            .map(|seen| seen.get(path) == Some(marker))
            .unwrap_or(false)
    }

    fn mark_seen(&self, path: BlobPath, marker: ChangeMarker) {
        if let Ok(mut seen) = self.last_seen.lock() {
            seen.insert(path, marker);
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let stats = self.poll_once(&cancel).await;
            if stats.discovered > 0 || stats.failures > 0 {
                tracing::debug!(
                    "🔍 Poll '{}': {} listed, {} new, {} relayed, {} failed",
                    self.account,
                    stats.listed,
                    stats.discovered,
                    stats.relayed,
                    stats.failures
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                _ = wait_for_wake(self.wake.as_deref()) => {
                    tracing::debug!("⚡ Poll '{}' woken by blob write", self.account);
                }
            }
        }
    }

    async fn poll_once(&self, cancel: &CancellationToken) -> PollStats {
        let mut stats = PollStats::default();
        for container in self.containers() {
            if cancel.is_cancelled() {
                break;
            }
            stats.containers += 1;

            let (entries, error) = self.list_container(&container, cancel).await;
            if let Some(e) = error {
                stats.failures += 1;
                self.report(&format!("listing '{container}'"), &e);
            }
            stats.listed += entries.len();

            for entry in entries {
                if cancel.is_cancelled() {
                    break;
                }
                let path = BlobPath::new(&container, &entry.name);
                if self.already_seen(&path, &entry.change_marker) {
                    continue;
                }
                let handlers = self.handlers_for(&path);
                if !handlers.is_empty() {
                    stats.discovered += 1;
                }
                let results = join_all(handlers.iter().map(|h| h.on_discovered(&path, &entry))).await;

                let mut settled = true;
                for (handler, result) in handlers.iter().zip(results) {
                    match result {
                        Ok(outcome) => {
                            if outcome == RelayOutcome::Relayed {
                                stats.relayed += 1;
                            }
                            settled &= outcome.is_settled();
                        }
                        Err(e) => {
                            settled = false;
                            stats.failures += 1;
                            self.report(
                                &format!("relaying '{path}' for '{}'", handler.function_id()),
                                &e,
                            );
                        }
                    }
                }
                if settled {
                    self.mark_seen(path, entry.change_marker);
                }
            }
        }
        stats
    }

    /// Every page of `container`. A page that still fails after its retries
    /// ends the listing; the entries gathered so far are returned with it.
    async fn list_container(
        &self,
        container: &str,
        cancel: &CancellationToken,
    ) -> (Vec<BlobEntry>, Option<RelayError>) {
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            match self.list_page(container, token.as_deref(), cancel).await {
                Ok(page) => {
                    entries.extend(page.entries);
                    match page.next_page {
                        Some(next) => token = Some(next),
                        None => return (entries, None),
                    }
                }
                Err(e) => return (entries, Some(e)),
            }
        }
    }

    async fn list_page(
        &self,
        container: &str,
        token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<relayhost_core::types::BlobListing> {
        let attempts = self.options.list_retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.blobs.list_blobs(container, token).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self
                        .options
                        .list_retry_base
                        .saturating_mul(1 << (attempt - 1).min(16));
                    tracing::warn!(
                        "⚠️ Listing '{}' failed (attempt {}/{}), retrying in {:?}: {}",
                        container,
                        attempt,
                        attempts,
                        delay,
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn report(&self, context: &str, error: &RelayError) {
        match error {
            RelayError::Cancelled => {}
            e if e.is_transient() => {
                tracing::warn!("⚠️ Poll '{}' {} failed, next tick retries: {}", self.account, context, e);
            }
            _ => self
                .exception_sink
                .report(&format!("blob poller '{}' ({context})", self.account), error),
        }
    }
}

async fn wait_for_wake(notify: Option<&Notify>) {
    match notify {
        Some(n) => n.notified().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Listener for BlobChangePoller {
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

#[cfg(test)]
mod tests {
    use super::*;
    use relayhost_core::blob_path::BlobPathSource;
    use relayhost_storage::MemoryBlobStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recording {
        id: String,
        source: BlobPathSource,
        seen: Mutex<Vec<String>>,
        outcome: RelayOutcome,
        fail_first: AtomicU32,
    }

    impl Recording {
        fn new(id: &str, pattern: &str, outcome: RelayOutcome) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                source: BlobPathSource::parse(pattern).unwrap(),
                seen: Mutex::new(Vec::new()),
                outcome,
                fail_first: AtomicU32::new(0),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BlobDiscoveryHandler for Recording {
        fn function_id(&self) -> &str {
            &self.id
        }

        fn source(&self) -> &BlobPathSource {
            &self.source
        }

        async fn on_discovered(&self, path: &BlobPath, _entry: &BlobEntry) -> Result<RelayOutcome> {
            self.seen.lock().unwrap().push(path.to_string());
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RelayError::Storage("receipt store down".into()));
            }
            Ok(self.outcome)
        }
    }

    #[derive(Default)]
    struct CountingSink(AtomicU32);

    impl ExceptionSink for CountingSink {
        fn report(&self, _source: &str, _error: &RelayError) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn poller(blobs: Arc<MemoryBlobStore>, sink: Arc<CountingSink>) -> BlobChangePoller {
        BlobChangePoller::new(
            "acct",
            blobs,
            PollerOptions {
                poll_interval: Duration::from_millis(10),
                list_retry_attempts: 3,
                list_retry_base: Duration::from_millis(1),
            },
            sink,
            None,
        )
    }

    #[tokio::test]
    async fn test_discovers_new_and_changed_blobs_only() {
        let blobs = Arc::new(MemoryBlobStore::with_page_size(2));
        for name in ["a.txt", "b.txt", "c.log"] {
            blobs.insert("docs", name, "x").unwrap();
        }
        let txt = Recording::new("txt", "docs/{name}.txt", RelayOutcome::Relayed);
        let all = Recording::new("all", "docs", RelayOutcome::Relayed);
        let p = poller(blobs.clone(), Arc::new(CountingSink::default()));
        p.register(txt.clone());
        p.register(all.clone());
        let cancel = CancellationToken::new();

        let stats = p.poll_once(&cancel).await;
        assert_eq!(stats.listed, 3);
        assert_eq!(stats.discovered, 3);
        assert_eq!(txt.seen(), vec!["docs/a.txt", "docs/b.txt"]);
        assert_eq!(all.seen().len(), 3);

        assert_eq!(p.poll_once(&cancel).await.discovered, 0);

        blobs.insert("docs", "b.txt", "changed").unwrap();
        let stats = p.poll_once(&cancel).await;
        assert_eq!(stats.discovered, 1);
        assert_eq!(txt.seen().last().map(String::as_str), Some("docs/b.txt"));
    }

    #[tokio::test]
    async fn test_transient_list_failures_are_retried() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.insert("docs", "a.txt", "x").unwrap();
        let sink = Arc::new(CountingSink::default());
        let handler = Recording::new("f", "docs/{name}", RelayOutcome::Relayed);
        let p = poller(blobs.clone(), sink.clone());
        p.register(handler.clone());
        let cancel = CancellationToken::new();

        blobs.fail_next_lists(2);
        let stats = p.poll_once(&cancel).await;
        assert_eq!(stats.failures, 0);
        assert_eq!(handler.seen().len(), 1);
        assert_eq!(blobs.list_calls(), 3);

        // Retries exhausted: logged, nothing reported, next tick succeeds.
        blobs.insert("docs", "b.txt", "x").unwrap();
        blobs.fail_next_lists(3);
        let stats = p.poll_once(&cancel).await;
        assert_eq!(stats.failures, 1);
        assert_eq!(sink.0.load(Ordering::SeqCst), 0);
        assert_eq!(p.poll_once(&cancel).await.discovered, 1);
    }

    #[tokio::test]
    async fn test_unsettled_blobs_are_retried_next_tick() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.insert("docs", "a.txt", "x").unwrap();
        let sink = Arc::new(CountingSink::default());
        let leased = Recording::new("leased", "docs/{name}", RelayOutcome::AlreadyLeased);
        let failing = Recording::new("failing", "docs/{name}", RelayOutcome::Relayed);
        failing.fail_first.store(1, Ordering::SeqCst);
        let p = poller(blobs, sink.clone());
        p.register(leased.clone());
        p.register(failing.clone());
        let cancel = CancellationToken::new();

        let stats = p.poll_once(&cancel).await;
        assert_eq!(stats.failures, 1);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);

        p.poll_once(&cancel).await;
        assert_eq!(leased.seen().len(), 2);
        assert_eq!(failing.seen().len(), 2);

        // Once the lease holder is gone the blob settles and drops out.
        p.unregister("leased");
        p.poll_once(&cancel).await;
        p.poll_once(&cancel).await;
        assert_eq!(failing.seen().len(), 3);
        assert_eq!(leased.seen().len(), 2);
    }

    #[tokio::test]
    async fn test_background_loop_and_wake() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let wake = Arc::new(Notify::new());
        let handler = Recording::new("f", "docs/{name}", RelayOutcome::Relayed);
        let p = BlobChangePoller::new(
            "acct",
            blobs.clone(),
            PollerOptions {
                poll_interval: Duration::from_secs(60),
                list_retry_attempts: 1,
                list_retry_base: Duration::from_millis(1),
            },
            Arc::new(CountingSink::default()),
            Some(wake.clone()),
        );
        p.register(handler.clone());
        p.start(CancellationToken::new()).await.unwrap();
        assert_eq!(p.state(), ListenerState::Running);

        tokio::time::sleep(Duration::from_millis(20)).await;
        blobs.insert("docs", "late.txt", "x").unwrap();
        wake.notify_one();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while handler.seen().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handler.seen(), vec!["docs/late.txt"]);
        p.dispose().await.unwrap();
        assert_eq!(p.state(), ListenerState::Disposed);
    }
}
