//! Per-message queue policy: delete on success, delay on failure, poison on
//! exhaustion.
//!
//! The dispatcher calls [`QueueProcessor::begin_processing`] before invoking a
//! function and [`QueueProcessor::complete_processing`] with its result. Hosts
//! plug in their own processor through a [`QueueProcessorFactory`], usually
//! wrapping [`DefaultQueueProcessor`] to keep the standard contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relayhost_core::config::QueueConfig;
use relayhost_core::error::Result;
use relayhost_core::traits::QueueGateway;
use relayhost_core::types::{FunctionResult, QueueMessage};

/// How long a failed message stays invisible before its next attempt.
pub trait BackoffPolicy: Send + Sync {
    /// Delay after a failed attempt; `dequeue_count` starts at 1. Must be
    /// non-decreasing in `dequeue_count` and bounded.
    fn visibility_delay(&self, dequeue_count: u32) -> Duration;
}

/// `base * 2^(n-1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.retry_base(), config.retry_max())
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn visibility_delay(&self, dequeue_count: u32) -> Duration {
        let exponent = dequeue_count.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Notified when a message is moved to a poison queue.
pub trait PoisonObserver: Send + Sync {
    fn on_poisoned(&self, queue: &str, poison_queue: &str, message: &QueueMessage);
}

/// Static settings for one queue.
#[derive(Debug, Clone)]
pub struct QueueProcessorOptions {
    pub queue: String,
    pub poison_queue: String,
    pub batch_size: usize,
    pub max_dequeue_count: u32,
    /// Invisibility applied at dequeue while the function runs.
    pub visibility_timeout: Duration,
}

impl QueueProcessorOptions {
    pub fn from_config(queue: &str, config: &QueueConfig) -> Self {
        Self {
            queue: queue.to_string(),
            poison_queue: config.poison_queue_name(queue),
            batch_size: config.batch_size,
            max_dequeue_count: config.max_dequeue_count,
            visibility_timeout: config.visibility_timeout(),
        }
    }
}

/// Everything a processor needs, handed to the factory.
#[derive(Clone)]
pub struct QueueProcessorContext {
    pub queues: Arc<dyn QueueGateway>,
    pub options: QueueProcessorOptions,
    pub backoff: Arc<dyn BackoffPolicy>,
    pub poison_observer: Option<Arc<dyn PoisonObserver>>,
}

#[async_trait]
pub trait QueueProcessor: Send + Sync {
    fn batch_size(&self) -> usize;

    fn visibility_timeout(&self) -> Duration;

    /// Called before invoking. `Ok(false)` means the message was handled here
    /// (e.g. poisoned) and must not be invoked.
    async fn begin_processing(&self, message: &QueueMessage) -> Result<bool>;

    /// Settle the message according to the function result.
    async fn complete_processing(&self, message: &QueueMessage, result: &FunctionResult)
    -> Result<()>;
}

/// Builds the processor for each queue the host listens on.
pub trait QueueProcessorFactory: Send + Sync {
    fn create(&self, context: QueueProcessorContext) -> Arc<dyn QueueProcessor>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultQueueProcessorFactory;

impl QueueProcessorFactory for DefaultQueueProcessorFactory {
    fn create(&self, context: QueueProcessorContext) -> Arc<dyn QueueProcessor> {
        Arc::new(DefaultQueueProcessor::new(context))
    }
}

/// The standard delete / retry / poison contract.
pub struct DefaultQueueProcessor {
    ctx: QueueProcessorContext,
}

impl DefaultQueueProcessor {
    pub fn new(context: QueueProcessorContext) -> Self {
        Self { ctx: context }
    }

    pub fn options(&self) -> &QueueProcessorOptions {
        &self.ctx.options
    }

    /// Copy to the poison queue, then delete from the source.
    pub async fn move_to_poison(&self, message: &QueueMessage) -> Result<()> {
        let opts = &self.ctx.options;
        self.ctx
            .queues
            .enqueue(&opts.poison_queue, message.payload.clone())
            .await?;
        self.ctx.queues.delete(&opts.queue, message).await?;
        tracing::info!(
            "☠️ Message '{}' moved from '{}' to '{}' after {} attempt(s)",
            message.id,
            opts.queue,
            opts.poison_queue,
            message.dequeue_count
        );
        if let Some(observer) = &self.ctx.poison_observer {
            observer.on_poisoned(&opts.queue, &opts.poison_queue, message);
        }
        Ok(())
    }

    /// Put a fresh copy at the back of the queue, then delete the original.
    /// The copy starts with a zero dequeue count.
    pub async fn requeue(&self, message: &QueueMessage) -> Result<()> {
        let opts = &self.ctx.options;
        let id = self
            .ctx
            .queues
            .enqueue(&opts.queue, message.payload.clone())
            .await?;
        self.ctx.queues.delete(&opts.queue, message).await?;
        tracing::debug!("🔁 Message '{}' on '{}' requeued as '{}'", message.id, opts.queue, id);
        Ok(())
    }

    /// Make the message visible again after the backoff delay.
    pub async fn release_message(&self, message: &QueueMessage, delay: Duration) -> Result<()> {
        self.ctx
            .queues
            .update_visibility(&self.ctx.options.queue, message, delay)
            .await?;
        tracing::debug!(
            "🔁 Message '{}' on '{}' retries in {:?} (attempt {})",
            message.id,
            self.ctx.options.queue,
            delay,
            message.dequeue_count
        );
        Ok(())
    }
}

#[async_trait]
impl QueueProcessor for DefaultQueueProcessor {
    fn batch_size(&self) -> usize {
        self.ctx.options.batch_size
    }

    fn visibility_timeout(&self) -> Duration {
        self.ctx.options.visibility_timeout
    }

    async fn begin_processing(&self, message: &QueueMessage) -> Result<bool> {
        // A previous consumer died after the last allowed attempt.
        if message.dequeue_count > self.ctx.options.max_dequeue_count {
            self.move_to_poison(message).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn complete_processing(
        &self,
        message: &QueueMessage,
        result: &FunctionResult,
    ) -> Result<()> {
        match result {
            FunctionResult::Succeeded => {
                self.ctx.queues.delete(&self.ctx.options.queue, message).await
            }
            FunctionResult::Cancelled => self.release_message(message, Duration::ZERO).await,
            FunctionResult::Deferred(reason) => {
                tracing::warn!(
                    "⏳ Message '{}' on '{}' deferred: {}",
                    message.id,
                    self.ctx.options.queue,
                    reason
                );
                self.requeue(message).await
            }
            FunctionResult::Failed(reason) => {
                tracing::warn!(
                    "⚠️ Message '{}' on '{}' failed (attempt {}): {}",
                    message.id,
                    self.ctx.options.queue,
                    message.dequeue_count,
                    reason
                );
                if message.dequeue_count >= self.ctx.options.max_dequeue_count {
                    self.move_to_poison(message).await
                } else {
                    let delay = self.ctx.backoff.visibility_delay(message.dequeue_count);
                    self.release_message(message, delay).await
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayhost_storage::MemoryQueueService;
    use std::sync::Mutex;

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let policy = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.visibility_delay(0), Duration::from_secs(1));
        assert_eq!(policy.visibility_delay(1), Duration::from_secs(1));
        assert_eq!(policy.visibility_delay(2), Duration::from_secs(2));
        assert_eq!(policy.visibility_delay(4), Duration::from_secs(8));
        assert_eq!(policy.visibility_delay(40), Duration::from_secs(60));
        assert_eq!(policy.visibility_delay(u32::MAX), Duration::from_secs(60));

        let mut previous = Duration::ZERO;
        for n in 0..200 {
            let delay = policy.visibility_delay(n);
            assert!(delay >= previous, "delay shrank at dequeue count {n}");
            assert!(delay <= Duration::from_secs(60));
            previous = delay;
        }
    }

    #[derive(Default)]
    struct RecordingObserver(Mutex<Vec<String>>);

    impl PoisonObserver for RecordingObserver {
        fn on_poisoned(&self, queue: &str, poison_queue: &str, message: &QueueMessage) {
            self.0
                .lock()
                .unwrap()
                .push(format!("{queue}->{poison_queue}:{}", message.id));
        }
    }

    fn processor(
        queues: Arc<MemoryQueueService>,
        observer: Arc<RecordingObserver>,
    ) -> DefaultQueueProcessor {
        DefaultQueueProcessor::new(QueueProcessorContext {
            queues,
            options: QueueProcessorOptions {
                queue: "work".into(),
                poison_queue: "work-poison".into(),
                batch_size: 4,
                max_dequeue_count: 2,
                visibility_timeout: Duration::from_secs(30),
            },
            backoff: Arc::new(ExponentialBackoff::new(Duration::ZERO, Duration::ZERO)),
            poison_observer: Some(observer),
        })
    }

    async fn dequeue_one(queues: &MemoryQueueService) -> QueueMessage {
        queues
            .dequeue_batch("work", 1, Duration::from_secs(30))
            .await
            .unwrap()
            .pop()
            .unwrap()
    }

    #[tokio::test]
    async fn test_failure_then_poison() {
        let queues = Arc::new(MemoryQueueService::new());
        let observer = Arc::new(RecordingObserver::default());
        let p = processor(queues.clone(), observer.clone());
        queues.enqueue("work", b"job".to_vec()).await.unwrap();

        let first = dequeue_one(&queues).await;
        p.complete_processing(&first, &FunctionResult::Failed("x".into()))
            .await
            .unwrap();
        assert_eq!(queues.len("work"), 1);

        let second = dequeue_one(&queues).await;
        assert_eq!(second.dequeue_count, 2);
        p.complete_processing(&second, &FunctionResult::Failed("x".into()))
            .await
            .unwrap();
        assert!(queues.is_empty("work"));
        assert_eq!(queues.peek_payloads("work-poison"), vec![b"job".to_vec()]);
        assert_eq!(observer.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_begin_processing_poisons_exhausted_message() {
        let queues = Arc::new(MemoryQueueService::new());
        let p = processor(queues.clone(), Arc::new(RecordingObserver::default()));
        queues.enqueue("work", b"job".to_vec()).await.unwrap();

        for _ in 0..2 {
            let msg = dequeue_one(&queues).await;
            queues.update_visibility("work", &msg, Duration::ZERO).await.unwrap();
        }
        let third = dequeue_one(&queues).await;
        assert!(!p.begin_processing(&third).await.unwrap());
        assert!(queues.is_empty("work"));
        assert_eq!(queues.len("work-poison"), 1);
    }

    #[tokio::test]
    async fn test_deferred_requeues_without_spending_attempts() {
        let queues = Arc::new(MemoryQueueService::new());
        let observer = Arc::new(RecordingObserver::default());
        let p = processor(queues.clone(), observer.clone());
        queues.enqueue("work", b"job".to_vec()).await.unwrap();

        for _ in 0..4 {
            let msg = dequeue_one(&queues).await;
            assert_eq!(msg.dequeue_count, 1);
            assert!(p.begin_processing(&msg).await.unwrap());
            p.complete_processing(&msg, &FunctionResult::Deferred("store busy".into()))
                .await
                .unwrap();
            assert_eq!(queues.len("work"), 1);
        }
        assert!(queues.is_empty("work-poison"));
        assert!(observer.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_deletes_and_cancel_releases() {
        let queues = Arc::new(MemoryQueueService::new());
        let p = processor(queues.clone(), Arc::new(RecordingObserver::default()));
        queues.enqueue("work", b"a".to_vec()).await.unwrap();

        let msg = dequeue_one(&queues).await;
        p.complete_processing(&msg, &FunctionResult::Cancelled).await.unwrap();
        let again = dequeue_one(&queues).await;
        assert_eq!(again.id, msg.id);

        p.complete_processing(&again, &FunctionResult::Succeeded).await.unwrap();
        assert!(queues.is_empty("work"));
        assert!(queues.is_empty("work-poison"));
    }
}
