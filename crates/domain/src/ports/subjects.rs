use crate::DomainResult;
use crate::classifier::SubjectFeatures;
use crate::ports::BoxFuture;

/// Read access to moderated items and their owners.
pub trait SubjectDirectory: Send + Sync {
    /// Current attributes of an open item joined with its owner; `NotFound` otherwise.
    fn prediction_input(&self, subject_id: i64) -> BoxFuture<'_, DomainResult<SubjectFeatures>>;

    fn active_subjects_by_owner(&self, owner_id: i64) -> BoxFuture<'_, DomainResult<Vec<i64>>>;
}
