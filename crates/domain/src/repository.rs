//! Read-through / write-through bridge between the durable store and the result cache.
//!
//! Only `completed` tasks are ever written to the cache, under two keys: the task
//! itself (`task:{id}`) and the subject's latest verdict (`item:{subject}`). The
//! latest pointer is last-writer-wins; deletes repair it so it never names a row
//! that no longer exists.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::DomainResult;
use crate::error::DomainError;
use crate::moderation::{ModerationTask, NewModerationTask, TaskChanges};
use crate::ports::cache::{ResultCache, subject_key, task_key};
use crate::ports::store::ModerationStore;
use crate::ports::subjects::SubjectDirectory;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 14);

#[derive(Clone, Debug)]
pub struct CachePolicy {
    pub ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
        }
    }
}

#[derive(Clone)]
pub struct ResultRepository {
    store: Arc<dyn ModerationStore>,
    cache: Arc<dyn ResultCache>,
    subjects: Arc<dyn SubjectDirectory>,
    policy: CachePolicy,
}

impl ResultRepository {
    pub fn new(
        store: Arc<dyn ModerationStore>,
        cache: Arc<dyn ResultCache>,
        subjects: Arc<dyn SubjectDirectory>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            store,
            cache,
            subjects,
            policy,
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Plain insert used by the request path.
    pub async fn register(&self, task: &NewModerationTask) -> DomainResult<ModerationTask> {
        task.validate()?;
        self.store.insert(task).await
    }

    /// Insert that reports whether a row was created; a matching row makes it a no-op.
    pub async fn ensure_idempotency(&self, task: &NewModerationTask) -> DomainResult<bool> {
        task.validate()?;
        self.store.insert_if_absent(task).await
    }

    pub async fn get_by_task_id(&self, task_id: i64) -> DomainResult<ModerationTask> {
        if let Some(task) = self.cache.get(&task_key(task_id)).await? {
            return Ok(task);
        }

        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| DomainError::task_not_found(task_id))?;
        if task.is_completed() {
            self.cache_verdict(&task).await?;
        }
        Ok(task)
    }

    pub async fn get_latest_by_subject(
        &self,
        subject_id: i64,
    ) -> DomainResult<Option<ModerationTask>> {
        if let Some(task) = self.cache.get(&subject_key(subject_id)).await? {
            return Ok(Some(task));
        }

        let Some(task) = self.store.latest_by_subject(subject_id).await? else {
            return Ok(None);
        };
        if !task.is_completed() {
            debug!(
                subject_id,
                task_id = task.task_id,
                status = %task.status,
                "latest task is not completed; not surfaced"
            );
            return Ok(None);
        }
        self.cache_verdict(&task).await?;
        Ok(Some(task))
    }

    pub async fn get_many(&self, task_ids: &[i64]) -> DomainResult<Vec<ModerationTask>> {
        self.store.get_many(task_ids).await
    }

    pub async fn list_recent(&self, limit: usize) -> DomainResult<Vec<ModerationTask>> {
        self.store.list_recent(limit).await
    }

    pub async fn update(&self, task_id: i64, changes: &TaskChanges) -> DomainResult<ModerationTask> {
        changes.validate()?;
        let task = self.store.update(task_id, changes).await?;
        if task.is_completed() {
            self.cache_verdict(&task).await?;
        }
        Ok(task)
    }

    pub async fn delete(&self, task_id: i64) -> DomainResult<ModerationTask> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| DomainError::task_not_found(task_id))?;
        let subject_id = task.subject_id;
        let cached_latest = self.cache.get(&subject_key(subject_id)).await?;

        let deleted = self
            .store
            .delete(task_id)
            .await?
            .ok_or_else(|| DomainError::task_not_found(task_id))?;
        self.cache.delete(&task_key(task_id)).await?;

        let was_latest = cached_latest.is_some_and(|latest| latest.task_id == task_id);
        if was_latest {
            self.cache.delete(&subject_key(subject_id)).await?;
            match self.store.latest_completed_by_subject(subject_id).await? {
                Some(next) => {
                    debug!(
                        subject_id,
                        deleted_task_id = task_id,
                        latest_task_id = next.task_id,
                        "latest pointer repaired"
                    );
                    self.cache_verdict(&next).await?;
                }
                None => debug!(subject_id, "no completed task left for subject"),
            }
        }
        Ok(deleted)
    }

    /// The subject is gone for good: drop every task row and cache entry it owns.
    pub async fn delete_all_by_subject(&self, subject_id: i64) -> DomainResult<usize> {
        let removed = self.purge_subject(subject_id).await?;
        info!(subject_id, removed, "moderation history deleted for subject");
        Ok(removed)
    }

    /// The subject's content changed: its verdict history no longer applies and the
    /// next lookup must come from a fresh classification. Always purges every row and
    /// cache entry for the subject, whether or not a latest verdict exists.
    pub async fn invalidate_by_subject(&self, subject_id: i64) -> DomainResult<usize> {
        let removed = self.purge_subject(subject_id).await?;
        info!(subject_id, removed, "moderation history invalidated for subject");
        Ok(removed)
    }

    pub async fn delete_all_by_owner(&self, owner_id: i64) -> DomainResult<usize> {
        let subjects = self.subjects.active_subjects_by_owner(owner_id).await?;
        let mut removed = 0;
        for subject_id in subjects {
            removed += self.delete_all_by_subject(subject_id).await?;
        }
        Ok(removed)
    }

    pub async fn invalidate_by_owner(&self, owner_id: i64) -> DomainResult<usize> {
        let subjects = self.subjects.active_subjects_by_owner(owner_id).await?;
        let mut removed = 0;
        for subject_id in subjects {
            removed += self.invalidate_by_subject(subject_id).await?;
        }
        Ok(removed)
    }

    async fn purge_subject(&self, subject_id: i64) -> DomainResult<usize> {
        let latest = match self.cache.get(&subject_key(subject_id)).await? {
            Some(task) => Some(task),
            None => self.store.latest_by_subject(subject_id).await?,
        };

        let removed = self.store.delete_by_subject(subject_id).await?;

        let mut task_ids: BTreeSet<i64> = removed.iter().map(|task| task.task_id).collect();
        if let Some(latest) = &latest {
            task_ids.insert(latest.task_id);
        }
        let mut keys = vec![subject_key(subject_id)];
        keys.extend(task_ids.into_iter().map(task_key));
        self.cache.delete_many(&keys).await?;

        Ok(removed.len())
    }

    async fn cache_verdict(&self, task: &ModerationTask) -> DomainResult<()> {
        self.cache
            .set(&task_key(task.task_id), task, self.policy.ttl)
            .await?;
        self.cache
            .set(&subject_key(task.subject_id), task, self.policy.ttl)
            .await?;
        Ok(())
    }
}
