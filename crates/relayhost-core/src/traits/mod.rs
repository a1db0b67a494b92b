//! Collaborator traits: the seams between the pipeline and the outside world.

pub mod executor;
pub mod storage;

pub use executor::{ExceptionSink, FunctionExecutor, TracingExceptionSink};
pub use storage::{BlobGateway, QueueGateway, ReceiptStore};
