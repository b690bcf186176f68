use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use moderation_domain::ports::queue::{Delivery, MessageConsumer};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::processor::MessageProcessor;
use crate::supervisor::TaskSupervisor;

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// When a delivery is acknowledged relative to its processing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Commit as soon as processing is dispatched; a crash loses in-flight work.
    #[default]
    OnDispatch,
    /// Commit once processing completes or the message is dead-lettered.
    OnCompletion,
}

#[derive(Debug, Error)]
#[error("unknown commit policy '{0}', expected 'dispatch' or 'completion'")]
pub struct CommitPolicyParseError(String);

impl FromStr for CommitPolicy {
    type Err = CommitPolicyParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dispatch" | "on_dispatch" => Ok(Self::OnDispatch),
            "completion" | "on_completion" => Ok(Self::OnCompletion),
            other => Err(CommitPolicyParseError(other.to_string())),
        }
    }
}

pub struct ConsumerWorker {
    consumer: Arc<dyn MessageConsumer>,
    processor: Arc<MessageProcessor>,
    supervisor: TaskSupervisor,
    policy: CommitPolicy,
    poll_timeout: Duration,
}

impl ConsumerWorker {
    pub fn new(
        consumer: Arc<dyn MessageConsumer>,
        processor: Arc<MessageProcessor>,
        supervisor: TaskSupervisor,
        policy: CommitPolicy,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            consumer,
            processor,
            supervisor,
            policy,
            poll_timeout,
        }
    }

    /// Polls until `shutdown` fires. Processing is handed to the supervisor, so the
    /// loop only ever waits on the queue.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(policy = ?self.policy, "consumer started");
        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.consumer.poll(self.poll_timeout) => polled,
            };
            match polled {
                Ok(Some(delivery)) => self.dispatch(delivery).await,
                Ok(None) => {}
                Err(err) => {
                    error!(error = %err, "failed to poll request queue");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        info!("consumer stopped");
    }

    async fn dispatch(&self, delivery: Delivery) {
        let message = delivery.message.clone();
        if self.processor.retry_policy().is_exhausted(message.retry_count) {
            self.processor.reject_exhausted(&message).await;
            commit(self.consumer.as_ref(), &delivery).await;
            return;
        }

        let processor = self.processor.clone();
        match self.policy {
            CommitPolicy::OnDispatch => {
                self.supervisor.spawn(async move {
                    processor.process_with_retry(message).await;
                });
                commit(self.consumer.as_ref(), &delivery).await;
            }
            CommitPolicy::OnCompletion => {
                let consumer = self.consumer.clone();
                self.supervisor.spawn(async move {
                    processor.process_with_retry(message).await;
                    commit(consumer.as_ref(), &delivery).await;
                });
            }
        }
    }
}

async fn commit(consumer: &dyn MessageConsumer, delivery: &Delivery) {
    if let Err(err) = consumer.commit(delivery).await {
        error!(task_id = delivery.message.task_id, error = %err, "failed to commit delivery");
    }
}
