use std::sync::Arc;

use crate::DomainResult;
use crate::jobs::QueueMessage;
use crate::moderation::{ModerationTask, NewModerationTask};
use crate::ports::queue::MessagePublisher;
use crate::repository::ResultRepository;

#[derive(Clone, Debug, PartialEq)]
pub enum SubmitOutcome {
    /// A completed verdict already exists; nothing was enqueued.
    AlreadyModerated(ModerationTask),
    /// A pending task was registered and a request published for it.
    Accepted(ModerationTask),
}

impl SubmitOutcome {
    pub fn task(&self) -> &ModerationTask {
        match self {
            Self::AlreadyModerated(task) | Self::Accepted(task) => task,
        }
    }
}

/// Gateway-side entry point: registers a pending task and enqueues it for the worker.
#[derive(Clone)]
pub struct ModerationRequests {
    repository: ResultRepository,
    publisher: Arc<dyn MessagePublisher>,
}

impl ModerationRequests {
    pub fn new(repository: ResultRepository, publisher: Arc<dyn MessagePublisher>) -> Self {
        Self {
            repository,
            publisher,
        }
    }

    pub async fn submit(&self, subject_id: i64) -> DomainResult<SubmitOutcome> {
        if let Some(latest) = self.repository.get_latest_by_subject(subject_id).await? {
            return Ok(SubmitOutcome::AlreadyModerated(latest));
        }

        let task = self
            .repository
            .register(&NewModerationTask::pending(subject_id))
            .await?;
        let message = QueueMessage::moderation_request(task.task_id, subject_id);
        match self.publisher.publish(&message).await {
            Ok(()) => tracing::info!(task_id = task.task_id, subject_id, "moderation request enqueued"),
            // The pending row stays; the request can be resubmitted.
            Err(err) => tracing::error!(
                task_id = task.task_id,
                subject_id,
                error = %err,
                "failed to enqueue moderation request"
            ),
        }
        Ok(SubmitOutcome::Accepted(task))
    }
}
