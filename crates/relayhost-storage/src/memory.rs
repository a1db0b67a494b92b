//! In-memory storage: blobs, queues and receipts behind std mutexes.
//! Every operation is a short critical section; nothing awaits while locked.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayhost_core::error::{RelayError, Result};
use relayhost_core::traits::{BlobGateway, QueueGateway, ReceiptStore};
use relayhost_core::types::{
    BlobEntry, BlobListing, ChangeMarker, Lease, LeaseOutcome, QueueMessage, ReceiptKey,
};
use uuid::Uuid;

use crate::deadline_after;

fn poisoned<T>(e: std::sync::PoisonError<T>) -> RelayError {
    RelayError::Storage(format!("lock poisoned: {e}"))
}

/// Consume one pending injected fault, if any.
fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ─── Blobs ──────────────────────────────────────────────────

struct StoredBlob {
    data: Vec<u8>,
    change_marker: ChangeMarker,
    metadata: BTreeMap<String, String>,
}

impl StoredBlob {
    fn entry(&self, name: &str) -> BlobEntry {
        BlobEntry {
            name: name.to_string(),
            change_marker: self.change_marker.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// In-memory blob containers with paged listing.
pub struct MemoryBlobStore {
    containers: Mutex<HashMap<String, BTreeMap<String, StoredBlob>>>,
    page_size: usize,
    version: AtomicU64,
    list_faults: AtomicU32,
    list_calls: AtomicU64,
    property_faults: AtomicU32,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::with_page_size(500)
    }

    /// Smaller pages exercise continuation tokens.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
            version: AtomicU64::new(0),
            list_faults: AtomicU32::new(0),
            list_calls: AtomicU64::new(0),
            property_faults: AtomicU32::new(0),
        }
    }

    /// Write a blob synchronously; returns the new entry.
    pub fn insert(&self, container: &str, name: &str, data: impl Into<Vec<u8>>) -> Result<BlobEntry> {
        self.insert_with_metadata(container, name, data.into(), BTreeMap::new())
    }

    fn insert_with_metadata(
        &self,
        container: &str,
        name: &str,
        data: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<BlobEntry> {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let blob = StoredBlob {
            data,
            change_marker: ChangeMarker::new(format!("0x{version:016X}")),
            metadata,
        };
        let entry = blob.entry(name);
        let mut containers = self.containers.lock().map_err(poisoned)?;
        containers
            .entry(container.to_string())
            .or_default()
            .insert(name.to_string(), blob);
        Ok(entry)
    }

    /// Remove a blob; returns whether it existed.
    pub fn remove(&self, container: &str, name: &str) -> Result<bool> {
        let mut containers = self.containers.lock().map_err(poisoned)?;
        Ok(containers
            .get_mut(container)
            .is_some_and(|c| c.remove(name).is_some()))
    }

    /// Make the next `n` list calls fail with a transient error.
    pub fn fail_next_lists(&self, n: u32) {
        self.list_faults.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` property reads fail with a transient error.
    pub fn fail_next_property_reads(&self, n: u32) {
        self.property_faults.store(n, Ordering::SeqCst);
    }

    /// Total list calls served or failed.
    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobGateway for MemoryBlobStore {
    async fn list_blobs(&self, container: &str, page_token: Option<&str>) -> Result<BlobListing> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if take_fault(&self.list_faults) {
            return Err(RelayError::Transient(format!("injected list failure for '{container}'")));
        }

        let containers = self.containers.lock().map_err(poisoned)?;
        let Some(blobs) = containers.get(container) else {
            return Ok(BlobListing::default());
        };

        let mut entries = Vec::new();
        let mut next_page = None;
        let range = blobs.iter().filter(|(name, _)| match page_token {
            Some(token) => name.as_str() > token,
            None => true,
        });
        for (name, blob) in range {
            if entries.len() == self.page_size {
                next_page = entries.last().map(|e: &BlobEntry| e.name.clone());
                break;
            }
            entries.push(blob.entry(name));
        }
        Ok(BlobListing { entries, next_page })
    }

    async fn get_properties(&self, container: &str, name: &str) -> Result<Option<BlobEntry>> {
        if take_fault(&self.property_faults) {
            return Err(RelayError::Transient(format!(
                "injected property read failure for '{container}/{name}'"
            )));
        }
        let containers = self.containers.lock().map_err(poisoned)?;
        Ok(containers
            .get(container)
            .and_then(|c| c.get(name))
            .map(|b| b.entry(name)))
    }

    async fn get_blob(&self, container: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let containers = self.containers.lock().map_err(poisoned)?;
        Ok(containers
            .get(container)
            .and_then(|c| c.get(name))
            .map(|b| b.data.clone()))
    }

    async fn put_blob(
        &self,
        container: &str,
        name: &str,
        data: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<BlobEntry> {
        self.insert_with_metadata(container, name, data, metadata)
    }
}

// ─── Queues ─────────────────────────────────────────────────

struct StoredMessage {
    id: String,
    payload: Vec<u8>,
    dequeue_count: u32,
    pop_receipt: Option<String>,
    visible_at: DateTime<Utc>,
    inserted_at: DateTime<Utc>,
}

impl StoredMessage {
    /// A pop receipt is honored only while the message is still hidden.
    fn receipt_valid(&self, pop_receipt: &str, now: DateTime<Utc>) -> bool {
        self.pop_receipt.as_deref() == Some(pop_receipt) && self.visible_at > now
    }
}

/// In-memory queues with visibility timeouts and single-use pop receipts.
pub struct MemoryQueueService {
    queues: Mutex<HashMap<String, VecDeque<StoredMessage>>>,
    enqueue_faults: AtomicU32,
}

impl MemoryQueueService {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            enqueue_faults: AtomicU32::new(0),
        }
    }

    /// Make the next `n` enqueues fail with a transient error.
    pub fn fail_next_enqueues(&self, n: u32) {
        self.enqueue_faults.store(n, Ordering::SeqCst);
    }

    /// Messages in the queue, visible or not.
    pub fn len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .map(|q| q.get(queue).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Payloads in insertion order, without dequeuing.
    pub fn peek_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queues
            .lock()
            .map(|q| {
                q.get(queue)
                    .map(|msgs| msgs.iter().map(|m| m.payload.clone()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn with_message<T>(
        &self,
        queue: &str,
        message: &QueueMessage,
        op: impl FnOnce(&mut VecDeque<StoredMessage>, usize, DateTime<Utc>) -> T,
    ) -> Result<T> {
        let now = Utc::now();
        let mut queues = self.queues.lock().map_err(poisoned)?;
        let msgs = queues
            .get_mut(queue)
            .ok_or_else(|| RelayError::MessageNotFound(message.id.clone()))?;
        let idx = msgs
            .iter()
            .position(|m| m.id == message.id)
            .ok_or_else(|| RelayError::MessageNotFound(message.id.clone()))?;
        if !msgs[idx].receipt_valid(&message.pop_receipt, now) {
            return Err(RelayError::PopReceiptMismatch(message.id.clone()));
        }
        Ok(op(msgs, idx, now))
    }
}

impl Default for MemoryQueueService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueGateway for MemoryQueueService {
    async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<String> {
        if take_fault(&self.enqueue_faults) {
            return Err(RelayError::Transient(format!("injected enqueue failure for '{queue}'")));
        }
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut queues = self.queues.lock().map_err(poisoned)?;
        queues.entry(queue.to_string()).or_default().push_back(StoredMessage {
            id: id.clone(),
            payload,
            dequeue_count: 0,
            pop_receipt: None,
            visible_at: now,
            inserted_at: now,
        });
        Ok(id)
    }

    async fn dequeue_batch(
        &self,
        queue: &str,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>> {
        let now = Utc::now();
        let hidden_until = deadline_after(now, visibility_timeout);
        let mut queues = self.queues.lock().map_err(poisoned)?;
        let Some(msgs) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::new();
        for msg in msgs.iter_mut().filter(|m| m.visible_at <= now).take(max) {
            let receipt = Uuid::new_v4().to_string();
            msg.dequeue_count += 1;
            msg.pop_receipt = Some(receipt.clone());
            msg.visible_at = hidden_until;
            batch.push(QueueMessage {
                id: msg.id.clone(),
                payload: msg.payload.clone(),
                dequeue_count: msg.dequeue_count,
                pop_receipt: receipt,
                inserted_at: msg.inserted_at,
            });
        }
        Ok(batch)
    }

    async fn delete(&self, queue: &str, message: &QueueMessage) -> Result<()> {
        self.with_message(queue, message, |msgs, idx, _| {
            msgs.remove(idx);
        })
    }

    async fn update_visibility(
        &self,
        queue: &str,
        message: &QueueMessage,
        timeout: Duration,
    ) -> Result<String> {
        self.with_message(queue, message, |msgs, idx, now| {
            let receipt = Uuid::new_v4().to_string();
            msgs[idx].pop_receipt = Some(receipt.clone());
            msgs[idx].visible_at = deadline_after(now, timeout);
            receipt
        })
    }
}

// ─── Receipts ───────────────────────────────────────────────

#[derive(Default)]
struct ReceiptRecord {
    completed: bool,
    lease_owner: Option<String>,
    lease_expires: Option<DateTime<Utc>>,
}

impl ReceiptRecord {
    fn leased_by_other(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && self.lease_expires.is_some_and(|exp| exp > now)
    }

    fn owned_by(&self, token: &str) -> bool {
        self.lease_owner.as_deref() == Some(token)
    }
}

/// In-memory receipt ledger. Receipts are never deleted.
pub struct MemoryReceiptStore {
    receipts: Mutex<HashMap<ReceiptKey, ReceiptRecord>>,
}

impl MemoryReceiptStore {
    pub fn new() -> Self {
        Self {
            receipts: Mutex::new(HashMap::new()),
        }
    }

    /// Number of receipts ever created.
    pub fn len(&self) -> usize {
        self.receipts.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryReceiptStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReceiptStore for MemoryReceiptStore {
    async fn try_acquire_lease(&self, key: &ReceiptKey, duration: Duration) -> Result<LeaseOutcome> {
        let now = Utc::now();
        let mut receipts = self.receipts.lock().map_err(poisoned)?;
        let record = receipts.entry(key.clone()).or_default();
        if record.completed {
            return Ok(LeaseOutcome::AlreadyCompleted);
        }
        if record.leased_by_other(now) {
            return Ok(LeaseOutcome::AlreadyLeased);
        }
        let lease = Lease {
            key: key.clone(),
            token: Uuid::new_v4().to_string(),
            expires_at: deadline_after(now, duration),
        };
        record.lease_owner = Some(lease.token.clone());
        record.lease_expires = Some(lease.expires_at);
        Ok(LeaseOutcome::Acquired(lease))
    }

    async fn renew_lease(&self, lease: &Lease, duration: Duration) -> Result<Lease> {
        let now = Utc::now();
        let mut receipts = self.receipts.lock().map_err(poisoned)?;
        match receipts.get_mut(&lease.key) {
            Some(record) if record.owned_by(&lease.token) && !record.completed => {
                let expires_at = deadline_after(now, duration);
                record.lease_expires = Some(expires_at);
                Ok(Lease {
                    expires_at,
                    ..lease.clone()
                })
            }
            _ => Err(RelayError::LeaseLost(lease.key.to_string())),
        }
    }

    async fn mark_completed(&self, lease: &Lease) -> Result<()> {
        let mut receipts = self.receipts.lock().map_err(poisoned)?;
        match receipts.get_mut(&lease.key) {
            Some(record) if record.completed && record.owned_by(&lease.token) => Ok(()),
            Some(record) if !record.completed && record.owned_by(&lease.token) => {
                record.completed = true;
                Ok(())
            }
            _ => Err(RelayError::LeaseLost(lease.key.to_string())),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        let mut receipts = self.receipts.lock().map_err(poisoned)?;
        if let Some(record) = receipts.get_mut(&lease.key) {
            if record.owned_by(&lease.token) && !record.completed {
                record.lease_owner = None;
                record.lease_expires = None;
            }
        }
        Ok(())
    }

    async fn is_completed(&self, key: &ReceiptKey) -> Result<bool> {
        let receipts = self.receipts.lock().map_err(poisoned)?;
        Ok(receipts.get(key).is_some_and(|r| r.completed))
    }
}
