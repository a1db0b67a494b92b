//! # RelayHost Listeners
//!
//! The trigger pipeline: blob discovery, receipt-guarded relay, queue dispatch
//! with retry and poison handling, and the lifecycle plumbing around them.
//!
//! ## Architecture
//! ```text
//! RelayHost (CompositeListener)
//!   ├── SharedListenerHandle ──► BlobChangePoller (one per account)
//!   │                               └── BlobTriggerRelay per function
//!   │                                     └── lease → enqueue → complete
//!   ├── SharedListenerHandle ──► SharedBlobQueueListener (relay-blobtrigger-{host})
//!   │                               └── BlobQueueTriggerExecutor → FunctionExecutor
//!   └── QueueListener per queue-triggered function
//!                                   └── QueueTriggerExecutor → FunctionExecutor
//!
//! Writers (CausalQueueWriter, HostBlobWriter) stamp the parent id and
//! wake the listeners above through the fast-path watchers.
//! ```

pub mod blob_queue;
pub mod causality;
pub mod composite;
pub mod dispatcher;
pub mod host;
pub mod listener;
pub mod poller;
pub mod processor;
pub mod queue_trigger;
pub mod registry;
pub mod relay;
pub mod watchers;
pub mod writer;

pub use blob_queue::{BlobQueueTriggerExecutor, SharedBlobQueueListener};
pub use composite::CompositeListener;
pub use dispatcher::{DispatchState, PollSchedule, QueueListener, QueueMessageHandler};
pub use host::{RelayHost, RelayHostOptions, RelayHostServices};
pub use listener::{Listener, ListenerState};
pub use poller::{BlobChangePoller, PollStats, PollerOptions};
pub use processor::{
    BackoffPolicy, DefaultQueueProcessor, DefaultQueueProcessorFactory, ExponentialBackoff,
    PoisonObserver, QueueProcessor, QueueProcessorContext, QueueProcessorFactory,
    QueueProcessorOptions,
};
pub use queue_trigger::QueueTriggerExecutor;
pub use registry::{SharedListenerHandle, SharedListenerKey, SharedListenerRegistry};
pub use relay::{BlobDiscoveryHandler, BlobTriggerRelay, RelayMessage, RelayOutcome};
pub use watchers::{BlobWrittenWatcher, MessageEnqueuedWatcher};
pub use writer::{CausalQueueWriter, HostBlobWriter};
