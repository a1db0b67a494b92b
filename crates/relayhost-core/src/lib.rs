//! # RelayHost Core
//!
//! Shared vocabulary for the trigger relay: errors, configuration, the data
//! model that flows between listeners, and the collaborator traits that hide
//! the storage protocol and the function runtime.
//!
//! ## Architecture
//! ```text
//! BlobGateway ──list──► Blob Change Poller ──discovered──► Blob Trigger Relay
//!                                                           │  ReceiptStore (lease)
//!                                                           ▼
//! QueueGateway ◄──enqueue── relay message ── host blob-trigger queue
//!      │
//!      └──dequeue──► Queue Dispatcher ──invoke──► FunctionExecutor
//!                        ├── success  → delete
//!                        ├── failure  → update visibility (backoff)
//!                        └── exhausted → poison queue
//! ```

pub mod blob_path;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use blob_path::BlobPathSource;
pub use config::RelayHostConfig;
pub use error::{RelayError, Result};
pub use types::{
    BlobEntry, BlobListing, BlobPath, ChangeMarker, FunctionResult, Lease, LeaseOutcome,
    QueueMessage, ReceiptKey, TriggerData, TriggerValue,
};
