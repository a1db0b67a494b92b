//! Function execution and background error reporting.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::types::{FunctionResult, TriggerData};

/// Binds and runs a user function. Opaque to the relay pipeline.
#[async_trait]
pub trait FunctionExecutor: Send + Sync {
    /// Run `function_id` for one trigger. `cancel` fires on host shutdown;
    /// functions may observe it and return [`FunctionResult::Cancelled`].
    async fn invoke(
        &self,
        function_id: &str,
        trigger: TriggerData,
        cancel: CancellationToken,
    ) -> FunctionResult;
}

/// Receives unexpected errors from background loops. Must never block.
pub trait ExceptionSink: Send + Sync {
    fn report(&self, source: &str, error: &RelayError);
}

/// Default sink: logs and moves on.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingExceptionSink;

impl ExceptionSink for TracingExceptionSink {
    fn report(&self, source: &str, error: &RelayError) {
        tracing::error!("💥 Background error in {}: {}", source, error);
    }
}
