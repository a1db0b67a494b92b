//! Queue-triggered functions: one dispatcher per function, invoking it with
//! the raw message.

use std::sync::Arc;

use async_trait::async_trait;
use relayhost_core::traits::FunctionExecutor;
use relayhost_core::types::{FunctionResult, QueueMessage, TriggerData, TriggerValue};
use tokio_util::sync::CancellationToken;

use crate::causality;
use crate::dispatcher::QueueMessageHandler;

pub struct QueueTriggerExecutor {
    function_id: String,
    queue: String,
    executor: Arc<dyn FunctionExecutor>,
}

impl QueueTriggerExecutor {
    pub fn new(
        function_id: impl Into<String>,
        queue: impl Into<String>,
        executor: Arc<dyn FunctionExecutor>,
    ) -> Self {
        Self {
            function_id: function_id.into(),
            queue: queue.into(),
            executor,
        }
    }
}

#[async_trait]
impl QueueMessageHandler for QueueTriggerExecutor {
    async fn handle(&self, message: &QueueMessage, cancel: CancellationToken) -> FunctionResult {
        tracing::info!(
            "🚀 Invoking '{}' for message '{}' on '{}' (attempt {})",
            self.function_id,
            message.id,
            self.queue,
            message.dequeue_count
        );
        let trigger = TriggerData {
            value: TriggerValue::Queue {
                queue: self.queue.clone(),
                message: message.clone(),
            },
            parent_id: causality::extract_parent(&message.payload),
        };
        self.executor.invoke(&self.function_id, trigger, cancel).await
    }
}
