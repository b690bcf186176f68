use std::sync::Arc;
use std::time::Instant;

use moderation_domain::DomainResult;
use moderation_domain::classifier::PredictionService;
use moderation_domain::error::DomainError;
use moderation_domain::jobs::{DeadLetterMessage, QueueMessage, RetryPolicy};
use moderation_domain::moderation::TaskChanges;
use moderation_domain::ports::queue::DeadLetterSink;
use moderation_domain::repository::ResultRepository;
use tracing::{error, info, warn};

use crate::observability;

pub const EXCEEDED_RETRIES: &str = "exceeded maximum retry attempts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    NotFound,
    RetriesExhausted,
    Unexpected,
}

impl DeadLetterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Unexpected => "unexpected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    DeadLettered(DeadLetterReason),
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::DeadLettered(reason) => reason.as_str(),
        }
    }
}

/// Classifies one request and records the verdict, retrying transient failures with
/// exponential backoff and routing terminal failures to the dead-letter sink.
pub struct MessageProcessor {
    repository: ResultRepository,
    predictions: PredictionService,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
}

impl MessageProcessor {
    pub fn new(
        repository: ResultRepository,
        predictions: PredictionService,
        dead_letters: Arc<dyn DeadLetterSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            repository,
            predictions,
            dead_letters,
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Runs attempts until the message completes or is dead-lettered. Backoff sleeps
    /// happen here, inside the unit of work, never on the consume loop.
    pub async fn process_with_retry(&self, inbound: QueueMessage) -> Outcome {
        let started = Instant::now();
        let mut attempt = inbound.clone();
        let outcome = loop {
            let err = match self.process(&attempt).await {
                Ok(()) => break Outcome::Completed,
                Err(err) => err,
            };

            let retry_count = attempt.retry_count;
            if err.is_not_found() {
                let error = format!("item {} is not found", inbound.subject_id);
                break self
                    .fail(&inbound, retry_count, &error, DeadLetterReason::NotFound)
                    .await;
            }
            if !err.is_retryable() {
                break self
                    .fail(
                        &inbound,
                        retry_count,
                        &err.to_string(),
                        DeadLetterReason::Unexpected,
                    )
                    .await;
            }
            if self.retry.is_exhausted(retry_count) {
                let error = format!("{EXCEEDED_RETRIES}: {err}");
                break self
                    .fail(
                        &inbound,
                        retry_count,
                        &error,
                        DeadLetterReason::RetriesExhausted,
                    )
                    .await;
            }

            let delay = self.retry.delay_for(retry_count);
            warn!(
                task_id = attempt.task_id,
                subject_id = attempt.subject_id,
                retry_count,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "retryable failure; scheduling retry"
            );
            observability::register_retry_scheduled(retry_count);
            tokio::time::sleep(delay).await;
            attempt = attempt.next_retry();
        };

        observability::register_message_processed(
            outcome.label(),
            started.elapsed().as_secs_f64() * 1000.0,
        );
        outcome
    }

    /// Terminal path for a message that arrived with its retries already spent.
    pub async fn reject_exhausted(&self, message: &QueueMessage) -> Outcome {
        warn!(
            task_id = message.task_id,
            retry_count = message.retry_count,
            max_retries = self.retry.max_retries,
            "message exceeded max retries on receipt"
        );
        let outcome = self
            .fail(
                message,
                message.retry_count,
                EXCEEDED_RETRIES,
                DeadLetterReason::RetriesExhausted,
            )
            .await;
        observability::register_message_processed(outcome.label(), 0.0);
        outcome
    }

    async fn process(&self, message: &QueueMessage) -> DomainResult<()> {
        if message.retry_count > 0 {
            info!(
                task_id = message.task_id,
                subject_id = message.subject_id,
                retry_count = message.retry_count,
                "retrying moderation request"
            );
        } else {
            info!(
                task_id = message.task_id,
                subject_id = message.subject_id,
                "processing moderation request"
            );
        }

        let verdict = self.predictions.predict_subject(message.subject_id).await?;
        let changes = TaskChanges::completed(verdict.is_violation, verdict.probability);
        self.repository
            .update(message.task_id, &changes)
            .await
            .map_err(|err| match err {
                // Missing task row, not a missing item.
                DomainError::NotFound(what) => {
                    DomainError::Unexpected(format!("{what} not found"))
                }
                other => other,
            })?;

        info!(
            task_id = message.task_id,
            subject_id = message.subject_id,
            is_violation = verdict.is_violation,
            probability = verdict.probability,
            "moderation completed"
        );
        Ok(())
    }

    /// Records the failure and dead-letters `original` exactly as it was received;
    /// `retry_count` is the attempt that failed.
    async fn fail(
        &self,
        original: &QueueMessage,
        retry_count: u32,
        error: &str,
        reason: DeadLetterReason,
    ) -> Outcome {
        error!(
            task_id = original.task_id,
            subject_id = original.subject_id,
            retry_count,
            error,
            "moderation failed"
        );

        if let Err(err) = self
            .repository
            .update(original.task_id, &TaskChanges::failed(error))
            .await
        {
            error!(task_id = original.task_id, error = %err, "failed to record task failure");
        }

        let dead_letter = DeadLetterMessage::new(original.clone(), error, retry_count);
        match self.dead_letters.send(&dead_letter).await {
            Ok(()) => {
                warn!(
                    task_id = original.task_id,
                    retry_count,
                    reason = reason.as_str(),
                    "message dead-lettered"
                );
                observability::register_dead_letter(reason.as_str(), true);
            }
            Err(err) => {
                error!(task_id = original.task_id, error = %err, "failed to publish dead letter");
                observability::register_dead_letter(reason.as_str(), false);
            }
        }

        Outcome::DeadLettered(reason)
    }
}
