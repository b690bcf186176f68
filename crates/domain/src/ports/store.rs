use crate::DomainResult;
use crate::moderation::{ModerationTask, NewModerationTask, TaskChanges};
use crate::ports::BoxFuture;

/// Authoritative task records.
pub trait ModerationStore: Send + Sync {
    fn insert(&self, task: &NewModerationTask) -> BoxFuture<'_, DomainResult<ModerationTask>>;

    /// Returns `false` when a row with the same subject and status already exists.
    fn insert_if_absent(&self, task: &NewModerationTask) -> BoxFuture<'_, DomainResult<bool>>;

    fn get(&self, task_id: i64) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>>;

    fn get_many(&self, task_ids: &[i64]) -> BoxFuture<'_, DomainResult<Vec<ModerationTask>>>;

    fn list_recent(&self, limit: usize) -> BoxFuture<'_, DomainResult<Vec<ModerationTask>>>;

    /// Row with the greatest `processed_at` for the subject, whatever its status.
    fn latest_by_subject(
        &self,
        subject_id: i64,
    ) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>>;

    fn latest_completed_by_subject(
        &self,
        subject_id: i64,
    ) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>>;

    /// Fails with `NotFound` when the row does not exist.
    fn update(
        &self,
        task_id: i64,
        changes: &TaskChanges,
    ) -> BoxFuture<'_, DomainResult<ModerationTask>>;

    fn delete(&self, task_id: i64) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>>;

    fn delete_by_subject(&self, subject_id: i64)
    -> BoxFuture<'_, DomainResult<Vec<ModerationTask>>>;
}
