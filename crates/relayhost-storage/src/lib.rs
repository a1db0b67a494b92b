//! # RelayHost Storage
//!
//! Concrete gateways behind the core storage traits.
//!
//! - [`memory`]: process-local blob, queue and receipt stores. Used by tests
//!   and single-process hosts; supports fault injection.
//! - [`sqlite`]: receipt ledger and queue in one SQLite file, safe for several
//!   host processes on the same machine.
//! - [`local`]: a directory tree exposed as blob containers.

pub mod local;
pub mod memory;
pub mod sqlite;

pub use local::LocalBlobStore;
pub use memory::{MemoryBlobStore, MemoryQueueService, MemoryReceiptStore};
pub use sqlite::{SqliteQueueService, SqliteReceiptStore};

use std::time::Duration;

use chrono::{DateTime, Utc};

/// `now + timeout`, saturating at one year.
pub(crate) fn deadline_after(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(timeout)
        .unwrap_or_else(|_| chrono::Duration::days(365))
        .min(chrono::Duration::days(365));
    now + delta
}
