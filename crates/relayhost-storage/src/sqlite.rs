//! SQLite-backed receipt ledger and queue service.
//!
//! Several host processes may open the same database file: leases and
//! dequeues are single conditional statements (or an IMMEDIATE transaction),
//! so SQLite's write lock is the cross-process mutual exclusion. Every
//! statement runs on the blocking pool: the busy handler may sleep for up to
//! `BUSY_TIMEOUT` while another process holds that lock.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use relayhost_core::error::{RelayError, Result};
use relayhost_core::traits::{QueueGateway, ReceiptStore};
use relayhost_core::types::{Lease, LeaseOutcome, QueueMessage, ReceiptKey};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};
use uuid::Uuid;

use crate::deadline_after;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type SharedConnection = Arc<Mutex<Connection>>;

/// Busy/locked databases are contention, not corruption.
fn sql_error(e: rusqlite::Error) -> RelayError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            RelayError::Transient(format!("SQLite busy: {e}"))
        }
        _ => RelayError::Storage(format!("SQLite: {e}")),
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path).map_err(sql_error)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(sql_error)?;
    // WAL lets readers in other processes proceed while one writer holds the lock.
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
        .ok();
    Ok(conn)
}

fn lock(conn: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| RelayError::Storage(format!("lock poisoned: {e}")))
}

/// Run `f` against the connection on the blocking pool.
async fn blocking<T, F>(conn: &SharedConnection, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let mut guard = lock(&conn)?;
        f(&mut guard)
    })
    .await
    .map_err(|e| RelayError::Storage(format!("blocking task failed: {e}")))?
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

// ─── Receipts ───────────────────────────────────────────────

const RECEIPT_ROW: &str =
    "function_id = ?1 AND container = ?2 AND blob_name = ?3 AND change_marker = ?4";

/// `(completed, lease_owner)` for a receipt row, if the row exists.
fn receipt_row(conn: &Connection, key: &ReceiptKey) -> Result<Option<(bool, Option<String>)>> {
    conn.query_row(
        &format!("SELECT completed, lease_owner FROM blob_receipts WHERE {RECEIPT_ROW}"),
        params![
            key.function_id,
            key.container,
            key.blob_name,
            key.change_marker.as_str()
        ],
        |row| Ok((row.get::<_, i64>(0)? != 0, row.get(1)?)),
    )
    .optional()
    .map_err(sql_error)
}

/// Receipt ledger table. Rows are never deleted; a completed row keeps the
/// token of the lease that completed it.
pub struct SqliteReceiptStore {
    conn: SharedConnection,
}

impl SqliteReceiptStore {
    /// Open or create the ledger.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blob_receipts (
                function_id TEXT NOT NULL,
                container TEXT NOT NULL,
                blob_name TEXT NOT NULL,
                change_marker TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                lease_owner TEXT,
                lease_expires INTEGER,           -- unix millis
                created_at TEXT NOT NULL,
                completed_at TEXT,
                PRIMARY KEY (function_id, container, blob_name, change_marker)
            );",
        )
        .map_err(sql_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl ReceiptStore for SqliteReceiptStore {
    async fn try_acquire_lease(&self, key: &ReceiptKey, duration: Duration) -> Result<LeaseOutcome> {
        let key = key.clone();
        blocking(&self.conn, move |conn| {
            let now = Utc::now();
            let token = Uuid::new_v4().to_string();
            let expires_at = deadline_after(now, duration);

            conn.execute(
                "INSERT OR IGNORE INTO blob_receipts
                 (function_id, container, blob_name, change_marker, completed, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    key.function_id,
                    key.container,
                    key.blob_name,
                    key.change_marker.as_str(),
                    now.to_rfc3339()
                ],
            )
            .map_err(sql_error)?;

            let changed = conn
                .execute(
                    &format!(
                        "UPDATE blob_receipts SET lease_owner = ?5, lease_expires = ?6
                         WHERE {RECEIPT_ROW} AND completed = 0
                           AND (lease_owner IS NULL OR lease_expires IS NULL OR lease_expires <= ?7)"
                    ),
                    params![
                        key.function_id,
                        key.container,
                        key.blob_name,
                        key.change_marker.as_str(),
                        token,
                        millis(expires_at),
                        millis(now)
                    ],
                )
                .map_err(sql_error)?;
            if changed == 1 {
                return Ok(LeaseOutcome::Acquired(Lease {
                    key,
                    token,
                    expires_at,
                }));
            }

            Ok(match receipt_row(conn, &key)? {
                Some((true, _)) => LeaseOutcome::AlreadyCompleted,
                _ => LeaseOutcome::AlreadyLeased,
            })
        })
        .await
    }

    async fn renew_lease(&self, lease: &Lease, duration: Duration) -> Result<Lease> {
        let lease = lease.clone();
        blocking(&self.conn, move |conn| {
            let expires_at = deadline_after(Utc::now(), duration);
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE blob_receipts SET lease_expires = ?6
                         WHERE {RECEIPT_ROW} AND lease_owner = ?5 AND completed = 0"
                    ),
                    params![
                        lease.key.function_id,
                        lease.key.container,
                        lease.key.blob_name,
                        lease.key.change_marker.as_str(),
                        lease.token,
                        millis(expires_at)
                    ],
                )
                .map_err(sql_error)?;
            if changed == 1 {
                Ok(Lease { expires_at, ..lease })
            } else {
                Err(RelayError::LeaseLost(lease.key.to_string()))
            }
        })
        .await
    }

    async fn mark_completed(&self, lease: &Lease) -> Result<()> {
        let lease = lease.clone();
        blocking(&self.conn, move |conn| {
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE blob_receipts SET completed = 1, completed_at = ?6
                         WHERE {RECEIPT_ROW} AND lease_owner = ?5 AND completed = 0"
                    ),
                    params![
                        lease.key.function_id,
                        lease.key.container,
                        lease.key.blob_name,
                        lease.key.change_marker.as_str(),
                        lease.token,
                        Utc::now().to_rfc3339()
                    ],
                )
                .map_err(sql_error)?;
            if changed == 1 {
                return Ok(());
            }
            // Repeat completion by the same holder is fine; anything else means
            // another worker took the lease.
            match receipt_row(conn, &lease.key)? {
                Some((true, Some(owner))) if owner == lease.token => Ok(()),
                _ => Err(RelayError::LeaseLost(lease.key.to_string())),
            }
        })
        .await
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        let lease = lease.clone();
        blocking(&self.conn, move |conn| {
            conn.execute(
                &format!(
                    "UPDATE blob_receipts SET lease_owner = NULL, lease_expires = NULL
                     WHERE {RECEIPT_ROW} AND lease_owner = ?5 AND completed = 0"
                ),
                params![
                    lease.key.function_id,
                    lease.key.container,
                    lease.key.blob_name,
                    lease.key.change_marker.as_str(),
                    lease.token
                ],
            )
            .map_err(sql_error)?;
            Ok(())
        })
        .await
    }

    async fn is_completed(&self, key: &ReceiptKey) -> Result<bool> {
        let key = key.clone();
        blocking(&self.conn, move |conn| {
            Ok(receipt_row(conn, &key)?.is_some_and(|(completed, _)| completed))
        })
        .await
    }
}

// ─── Queues ─────────────────────────────────────────────────

/// Durable queues in a single `queue_messages` table.
pub struct SqliteQueueService {
    conn: SharedConnection,
}

impl SqliteQueueService {
    /// Open or create the queue tables.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queue_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                queue TEXT NOT NULL,
                payload BLOB NOT NULL,
                dequeue_count INTEGER NOT NULL DEFAULT 0,
                pop_receipt TEXT,
                visible_at INTEGER NOT NULL,     -- unix millis
                inserted_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_visible ON queue_messages (queue, visible_at, seq);",
        )
        .map_err(sql_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Messages in the queue, visible or not.
    pub async fn len(&self, queue: &str) -> Result<usize> {
        let queue = queue.to_string();
        blocking(&self.conn, move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM queue_messages WHERE queue = ?1",
                    params![queue],
                    |row| row.get(0),
                )
                .map_err(sql_error)?;
            Ok(count as usize)
        })
        .await
    }

    /// Explain a failed conditional update on a message.
    fn stale_handle_error(conn: &Connection, queue: &str, message_id: &str) -> RelayError {
        let exists = conn
            .query_row(
                "SELECT 1 FROM queue_messages WHERE queue = ?1 AND id = ?2",
                params![queue, message_id],
                |_| Ok(()),
            )
            .optional();
        match exists {
            Ok(Some(())) => RelayError::PopReceiptMismatch(message_id.to_string()),
            Ok(None) => RelayError::MessageNotFound(message_id.to_string()),
            Err(e) => sql_error(e),
        }
    }
}

#[async_trait]
impl QueueGateway for SqliteQueueService {
    async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<String> {
        let queue = queue.to_string();
        blocking(&self.conn, move |conn| {
            let id = Uuid::new_v4().to_string();
            let now = millis(Utc::now());
            conn.execute(
                "INSERT INTO queue_messages (id, queue, payload, dequeue_count, visible_at, inserted_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                params![id, queue, payload, now],
            )
            .map_err(sql_error)?;
            Ok(id)
        })
        .await
    }

    async fn dequeue_batch(
        &self,
        queue: &str,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>> {
        let queue = queue.to_string();
        blocking(&self.conn, move |conn| {
            let now = Utc::now();
            let hidden_until = millis(deadline_after(now, visibility_timeout));
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error)?;

            let candidates: Vec<(String, Vec<u8>, u32, i64)> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT id, payload, dequeue_count, inserted_at FROM queue_messages
                         WHERE queue = ?1 AND visible_at <= ?2
                         ORDER BY seq LIMIT ?3",
                    )
                    .map_err(sql_error)?;
                let rows = stmt
                    .query_map(params![queue, millis(now), max as i64], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })
                    .map_err(sql_error)?;
                let collected = rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql_error)?;
                collected
            };

            let mut batch = Vec::with_capacity(candidates.len());
            for (id, payload, dequeue_count, inserted_at) in candidates {
                let receipt = Uuid::new_v4().to_string();
                tx.execute(
                    "UPDATE queue_messages
                     SET dequeue_count = dequeue_count + 1, pop_receipt = ?2, visible_at = ?3
                     WHERE id = ?1",
                    params![id, receipt, hidden_until],
                )
                .map_err(sql_error)?;
                batch.push(QueueMessage {
                    id,
                    payload,
                    dequeue_count: dequeue_count + 1,
                    pop_receipt: receipt,
                    inserted_at: from_millis(inserted_at),
                });
            }
            tx.commit().map_err(sql_error)?;
            Ok(batch)
        })
        .await
    }

    async fn delete(&self, queue: &str, message: &QueueMessage) -> Result<()> {
        let queue = queue.to_string();
        let id = message.id.clone();
        let pop_receipt = message.pop_receipt.clone();
        blocking(&self.conn, move |conn| {
            let changed = conn
                .execute(
                    "DELETE FROM queue_messages
                     WHERE queue = ?1 AND id = ?2 AND pop_receipt = ?3 AND visible_at > ?4",
                    params![queue, id, pop_receipt, millis(Utc::now())],
                )
                .map_err(sql_error)?;
            if changed == 1 {
                Ok(())
            } else {
                Err(Self::stale_handle_error(conn, &queue, &id))
            }
        })
        .await
    }

    async fn update_visibility(
        &self,
        queue: &str,
        message: &QueueMessage,
        timeout: Duration,
    ) -> Result<String> {
        let queue = queue.to_string();
        let id = message.id.clone();
        let pop_receipt = message.pop_receipt.clone();
        blocking(&self.conn, move |conn| {
            let now = Utc::now();
            let receipt = Uuid::new_v4().to_string();
            let changed = conn
                .execute(
                    "UPDATE queue_messages SET pop_receipt = ?4, visible_at = ?5
                     WHERE queue = ?1 AND id = ?2 AND pop_receipt = ?3 AND visible_at > ?6",
                    params![
                        queue,
                        id,
                        pop_receipt,
                        receipt,
                        millis(deadline_after(now, timeout)),
                        millis(now)
                    ],
                )
                .map_err(sql_error)?;
            if changed == 1 {
                Ok(receipt)
            } else {
                Err(Self::stale_handle_error(conn, &queue, &id))
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayhost_core::types::{BlobPath, ChangeMarker};
    use std::path::PathBuf;

    fn temp_db(tag: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("relayhost-sqlite-{tag}-{}", Uuid::new_v4()));
        let path = dir.join("relay.db");
        (dir, path)
    }

    fn key() -> ReceiptKey {
        ReceiptKey::new("fn", &BlobPath::new("c", "a.txt"), &ChangeMarker::new("0x1"))
    }

    #[tokio::test]
    async fn test_receipt_lease_and_completion() {
        let (dir, path) = temp_db("receipts");
        let store = SqliteReceiptStore::open(&path).unwrap();

        let LeaseOutcome::Acquired(lease) =
            store.try_acquire_lease(&key(), Duration::from_secs(30)).await.unwrap()
        else {
            panic!("expected lease");
        };
        assert_eq!(
            store.try_acquire_lease(&key(), Duration::from_secs(30)).await.unwrap(),
            LeaseOutcome::AlreadyLeased
        );
        store.renew_lease(&lease, Duration::from_secs(30)).await.unwrap();
        store.mark_completed(&lease).await.unwrap();
        store.mark_completed(&lease).await.unwrap();
        store.release_lease(&lease).await.unwrap();
        assert!(store.is_completed(&key()).await.unwrap());
        assert_eq!(
            store.try_acquire_lease(&key(), Duration::from_secs(30)).await.unwrap(),
            LeaseOutcome::AlreadyCompleted
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_two_handles_share_one_ledger() {
        let (dir, path) = temp_db("shared");
        let a = SqliteReceiptStore::open(&path).unwrap();
        let b = SqliteReceiptStore::open(&path).unwrap();

        let outcome_a = a.try_acquire_lease(&key(), Duration::from_secs(30)).await.unwrap();
        let outcome_b = b.try_acquire_lease(&key(), Duration::from_secs(30)).await.unwrap();
        assert!(matches!(outcome_a, LeaseOutcome::Acquired(_)));
        assert_eq!(outcome_b, LeaseOutcome::AlreadyLeased);

        if let LeaseOutcome::Acquired(lease) = outcome_a {
            a.release_lease(&lease).await.unwrap();
        }
        assert!(matches!(
            b.try_acquire_lease(&key(), Duration::from_secs(30)).await.unwrap(),
            LeaseOutcome::Acquired(_)
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_expired_lease_is_lost() {
        let (dir, path) = temp_db("expired");
        let store = SqliteReceiptStore::open(&path).unwrap();
        let LeaseOutcome::Acquired(stale) =
            store.try_acquire_lease(&key(), Duration::ZERO).await.unwrap()
        else {
            panic!("expected lease");
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(matches!(
            store.try_acquire_lease(&key(), Duration::from_secs(30)).await.unwrap(),
            LeaseOutcome::Acquired(_)
        ));
        assert!(matches!(
            store.renew_lease(&stale, Duration::from_secs(30)).await,
            Err(RelayError::LeaseLost(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_completion_after_lease_taken_over_is_lost() {
        let (dir, path) = temp_db("takeover");
        let a = SqliteReceiptStore::open(&path).unwrap();
        let b = SqliteReceiptStore::open(&path).unwrap();

        let LeaseOutcome::Acquired(stale) = a.try_acquire_lease(&key(), Duration::ZERO).await.unwrap()
        else {
            panic!("expected lease");
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let LeaseOutcome::Acquired(fresh) =
            b.try_acquire_lease(&key(), Duration::from_secs(30)).await.unwrap()
        else {
            panic!("expected lease");
        };

        assert!(matches!(a.mark_completed(&stale).await, Err(RelayError::LeaseLost(_))));
        assert!(!b.is_completed(&key()).await.unwrap());

        b.mark_completed(&fresh).await.unwrap();
        b.release_lease(&fresh).await.unwrap();
        b.mark_completed(&fresh).await.unwrap();
        assert!(matches!(a.mark_completed(&stale).await, Err(RelayError::LeaseLost(_))));
        assert!(a.is_completed(&key()).await.unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_leases_across_handles() {
        let (dir, path) = temp_db("concurrent");
        let stores = [
            Arc::new(SqliteReceiptStore::open(&path).unwrap()),
            Arc::new(SqliteReceiptStore::open(&path).unwrap()),
        ];

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = stores[i % 2].clone();
            tasks.push(tokio::spawn(async move {
                store.try_acquire_lease(&key(), Duration::from_secs(30)).await
            }));
        }
        // The runtime keeps serving other tasks while the handles contend.
        let ticker = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            true
        });

        let mut acquired = 0;
        for task in tasks {
            match task.await.unwrap().unwrap() {
                LeaseOutcome::Acquired(_) => acquired += 1,
                LeaseOutcome::AlreadyLeased => {}
                LeaseOutcome::AlreadyCompleted => panic!("nothing completed yet"),
            }
        }
        assert_eq!(acquired, 1);
        assert!(ticker.await.unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_queue_roundtrip() {
        let (dir, path) = temp_db("queue");
        let queues = SqliteQueueService::open(&path).unwrap();
        queues.enqueue("jobs", b"first".to_vec()).await.unwrap();
        queues.enqueue("jobs", b"second".to_vec()).await.unwrap();
        queues.enqueue("other", b"x".to_vec()).await.unwrap();

        let batch = queues.dequeue_batch("jobs", 1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"first");
        assert_eq!(batch[0].dequeue_count, 1);

        queues.update_visibility("jobs", &batch[0], Duration::ZERO).await.unwrap();
        assert!(matches!(
            queues.delete("jobs", &batch[0]).await,
            Err(RelayError::PopReceiptMismatch(_))
        ));

        let batch = queues.dequeue_batch("jobs", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].dequeue_count, 2);
        for msg in &batch {
            queues.delete("jobs", msg).await.unwrap();
        }
        assert_eq!(queues.len("jobs").await.unwrap(), 0);
        assert_eq!(queues.len("other").await.unwrap(), 1);
        assert!(matches!(
            queues.delete("jobs", &batch[0]).await,
            Err(RelayError::MessageNotFound(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
