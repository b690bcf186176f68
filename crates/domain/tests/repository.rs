use std::sync::Arc;
use std::time::Duration;

use moderation_domain::DomainResult;
use moderation_domain::classifier::SubjectFeatures;
use moderation_domain::error::DomainError;
use moderation_domain::memory::{
    InMemoryModerationStore, InMemoryResultCache, InMemorySubjectDirectory,
};
use moderation_domain::moderation::{
    ModerationStatus, ModerationTask, NewModerationTask, TaskChanges,
};
use moderation_domain::ports::BoxFuture;
use moderation_domain::ports::cache::{CacheError, subject_key, task_key};
use moderation_domain::ports::store::ModerationStore;
use moderation_domain::repository::{CachePolicy, ResultRepository};
use time::OffsetDateTime;
use time::macros::datetime;

struct Fixture {
    store: InMemoryModerationStore,
    cache: InMemoryResultCache,
    subjects: InMemorySubjectDirectory,
    repository: ResultRepository,
}

fn fixture() -> Fixture {
    let store = InMemoryModerationStore::new();
    let cache = InMemoryResultCache::new();
    let subjects = InMemorySubjectDirectory::new();
    let repository = ResultRepository::new(
        Arc::new(store.clone()),
        Arc::new(cache.clone()),
        Arc::new(subjects.clone()),
        CachePolicy::default(),
    );
    Fixture {
        store,
        cache,
        subjects,
        repository,
    }
}

impl Fixture {
    /// Same store, cold cache.
    fn cold_repository(&self) -> (InMemoryResultCache, ResultRepository) {
        let cache = InMemoryResultCache::new();
        let repository = ResultRepository::new(
            Arc::new(self.store.clone()),
            Arc::new(cache.clone()),
            Arc::new(self.subjects.clone()),
            CachePolicy::default(),
        );
        (cache, repository)
    }

    async fn pending(&self, subject_id: i64) -> ModerationTask {
        self.repository
            .register(&NewModerationTask::pending(subject_id))
            .await
            .unwrap()
    }

    async fn completed(
        &self,
        subject_id: i64,
        is_violation: bool,
        processed_at: OffsetDateTime,
    ) -> ModerationTask {
        let task = self.pending(subject_id).await;
        self.repository
            .update(
                task.task_id,
                &TaskChanges::completed(is_violation, 0.8).processed_at(processed_at),
            )
            .await
            .unwrap()
    }

    async fn failed(&self, subject_id: i64, processed_at: OffsetDateTime) -> ModerationTask {
        let task = self.pending(subject_id).await;
        self.repository
            .update(
                task.task_id,
                &TaskChanges::failed("timeout talking to classifier").processed_at(processed_at),
            )
            .await
            .unwrap()
    }
}

fn listing(subject_id: i64, owner_id: i64) -> SubjectFeatures {
    SubjectFeatures {
        owner_id,
        is_verified_owner: false,
        subject_id,
        name: format!("listing {subject_id}"),
        description: "used, works fine".to_string(),
        category: 12,
        images_qty: 2,
    }
}

#[tokio::test]
async fn completed_update_is_served_from_cache_afterwards() {
    let fx = fixture();
    let task = fx.pending(42).await;

    let updated = fx
        .repository
        .update(task.task_id, &TaskChanges::completed(true, 0.93))
        .await
        .unwrap();
    assert_eq!(updated.status, ModerationStatus::Completed);
    assert!(updated.check_invariants().is_ok());

    let reads_before = fx.store.reads();
    let by_id = fx.repository.get_by_task_id(task.task_id).await.unwrap();
    let latest = fx.repository.get_latest_by_subject(42).await.unwrap();
    assert_eq!(fx.store.reads(), reads_before);

    assert_eq!(by_id, updated);
    assert_eq!(latest, Some(updated));
}

#[tokio::test]
async fn cache_entries_carry_the_configured_ttl() {
    let fx = fixture();
    let task = fx.completed(5, false, datetime!(2025-03-01 10:00 UTC)).await;

    for key in [task_key(task.task_id), subject_key(5)] {
        let ttl = fx.cache.ttl_remaining(&key).await.unwrap();
        assert!(ttl > Duration::from_secs(60 * 60 * 24 * 13), "{key}: {ttl:?}");
        assert!(ttl <= Duration::from_secs(60 * 60 * 24 * 14), "{key}: {ttl:?}");
    }
}

#[tokio::test]
async fn oversized_ttl_is_clamped_instead_of_overflowing() {
    let store = InMemoryModerationStore::new();
    let cache = InMemoryResultCache::new();
    let repository = ResultRepository::new(
        Arc::new(store.clone()),
        Arc::new(cache.clone()),
        Arc::new(InMemorySubjectDirectory::new()),
        CachePolicy { ttl: Duration::MAX },
    );
    let task = repository
        .register(&NewModerationTask::pending(6))
        .await
        .unwrap();
    let updated = repository
        .update(task.task_id, &TaskChanges::completed(true, 0.9))
        .await
        .unwrap();

    let ttl = cache.ttl_remaining(&task_key(task.task_id)).await.unwrap();
    assert!(ttl > Duration::from_secs(60 * 60 * 24 * 365), "{ttl:?}");
    let reads_before = store.reads();
    assert_eq!(repository.get_by_task_id(task.task_id).await.unwrap(), updated);
    assert_eq!(store.reads(), reads_before);
}

#[tokio::test]
async fn read_through_populates_both_keys_for_completed_rows() {
    let fx = fixture();
    let task = fx.completed(8, false, datetime!(2025-03-01 10:00 UTC)).await;
    let (cold_cache, cold) = fx.cold_repository();

    let fetched = cold.get_by_task_id(task.task_id).await.unwrap();
    assert_eq!(fetched, task);
    assert!(cold_cache.contains(&task_key(task.task_id)).await);
    assert!(cold_cache.contains(&subject_key(8)).await);

    let reads_before = fx.store.reads();
    assert_eq!(cold.get_latest_by_subject(8).await.unwrap(), Some(task));
    assert_eq!(fx.store.reads(), reads_before);
}

#[tokio::test]
async fn pending_and_failed_rows_are_never_cached() {
    let fx = fixture();
    let pending = fx.pending(3).await;
    let failed = fx.failed(4, datetime!(2025-03-01 10:00 UTC)).await;

    assert_eq!(
        fx.repository.get_by_task_id(pending.task_id).await.unwrap(),
        pending
    );
    assert_eq!(
        fx.repository.get_by_task_id(failed.task_id).await.unwrap(),
        failed
    );
    assert!(!fx.cache.contains(&task_key(pending.task_id)).await);
    assert!(!fx.cache.contains(&task_key(failed.task_id)).await);
    assert!(!fx.cache.contains(&subject_key(4)).await);
}

#[tokio::test]
async fn missing_task_is_not_found() {
    let fx = fixture();
    let err = fx.repository.get_by_task_id(404).await.unwrap_err();
    assert!(err.is_not_found());

    let err = fx.repository.delete(404).await.unwrap_err();
    assert!(err.is_not_found());

    let err = fx
        .repository
        .update(404, &TaskChanges::completed(false, 0.1))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn latest_is_the_completed_row_with_greatest_processed_at() {
    let fx = fixture();
    fx.completed(9, false, datetime!(2025-03-01 09:00 UTC)).await;
    let newest = fx.completed(9, true, datetime!(2025-03-01 11:00 UTC)).await;
    fx.completed(9, false, datetime!(2025-03-01 10:00 UTC)).await;
    fx.pending(9).await;

    let (_, cold) = fx.cold_repository();
    assert_eq!(cold.get_latest_by_subject(9).await.unwrap(), Some(newest));
}

#[tokio::test]
async fn failed_latest_is_not_surfaced() {
    let fx = fixture();
    fx.failed(6, datetime!(2025-03-01 10:00 UTC)).await;

    assert_eq!(fx.repository.get_latest_by_subject(6).await.unwrap(), None);
    assert_eq!(fx.repository.get_latest_by_subject(7).await.unwrap(), None);
    assert!(!fx.cache.contains(&subject_key(6)).await);
}

#[tokio::test]
async fn deleting_the_latest_repairs_the_pointer() {
    let fx = fixture();
    let older = fx.completed(10, false, datetime!(2025-03-01 09:00 UTC)).await;
    let latest = fx.completed(10, true, datetime!(2025-03-01 10:00 UTC)).await;
    assert_eq!(
        fx.repository.get_latest_by_subject(10).await.unwrap(),
        Some(latest.clone())
    );

    let deleted = fx.repository.delete(latest.task_id).await.unwrap();
    assert_eq!(deleted, latest);
    assert!(!fx.cache.contains(&task_key(latest.task_id)).await);

    let reads_before = fx.store.reads();
    assert_eq!(
        fx.repository.get_latest_by_subject(10).await.unwrap(),
        Some(older.clone())
    );
    assert_eq!(fx.store.reads(), reads_before, "repair should repopulate the cache");
    assert!(fx.cache.contains(&task_key(older.task_id)).await);

    fx.repository.delete(older.task_id).await.unwrap();
    assert_eq!(fx.repository.get_latest_by_subject(10).await.unwrap(), None);
    assert!(!fx.cache.contains(&subject_key(10)).await);
}

#[tokio::test]
async fn deleting_an_older_task_leaves_the_latest_alone() {
    let fx = fixture();
    let older = fx.completed(11, false, datetime!(2025-03-01 09:00 UTC)).await;
    let latest = fx.completed(11, true, datetime!(2025-03-01 10:00 UTC)).await;

    fx.repository.delete(older.task_id).await.unwrap();

    assert_eq!(
        fx.repository.get_latest_by_subject(11).await.unwrap(),
        Some(latest)
    );
    let err = fx.repository.get_by_task_id(older.task_id).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn invalidation_voids_all_history_for_the_subject() {
    let fx = fixture();
    let older = fx.completed(12, false, datetime!(2025-03-01 09:00 UTC)).await;
    let latest = fx.completed(12, true, datetime!(2025-03-01 10:00 UTC)).await;
    fx.failed(12, datetime!(2025-03-01 08:00 UTC)).await;
    let other = fx.completed(13, false, datetime!(2025-03-01 10:00 UTC)).await;

    let removed = fx.repository.invalidate_by_subject(12).await.unwrap();
    assert_eq!(removed, 3);

    assert_eq!(fx.repository.get_latest_by_subject(12).await.unwrap(), None);
    assert!(fx.store.rows_for_subject(12).await.is_empty());
    for task_id in [older.task_id, latest.task_id] {
        assert!(!fx.cache.contains(&task_key(task_id)).await);
        assert!(fx.repository.get_by_task_id(task_id).await.unwrap_err().is_not_found());
    }
    assert_eq!(
        fx.repository.get_latest_by_subject(13).await.unwrap(),
        Some(other)
    );
}

#[tokio::test]
async fn invalidation_without_a_verdict_still_clears_rows() {
    let fx = fixture();
    fx.failed(14, datetime!(2025-03-01 08:00 UTC)).await;
    fx.pending(14).await;

    assert_eq!(fx.repository.invalidate_by_subject(14).await.unwrap(), 2);
    assert!(fx.store.rows_for_subject(14).await.is_empty());
}

#[tokio::test]
async fn deleting_a_subject_evicts_its_cache_entries() {
    let fx = fixture();
    let latest = fx.completed(15, true, datetime!(2025-03-01 10:00 UTC)).await;

    assert_eq!(fx.repository.delete_all_by_subject(15).await.unwrap(), 1);

    assert!(!fx.cache.contains(&subject_key(15)).await);
    assert!(!fx.cache.contains(&task_key(latest.task_id)).await);
    assert_eq!(fx.repository.get_latest_by_subject(15).await.unwrap(), None);
    assert_eq!(fx.repository.delete_all_by_subject(15).await.unwrap(), 0);
}

#[tokio::test]
async fn owner_operations_fan_out_to_owned_subjects() {
    let fx = fixture();
    fx.subjects.upsert(listing(20, 1)).await;
    fx.subjects.upsert(listing(21, 1)).await;
    fx.subjects.upsert(listing(30, 2)).await;
    fx.completed(20, false, datetime!(2025-03-01 10:00 UTC)).await;
    fx.completed(21, true, datetime!(2025-03-01 10:00 UTC)).await;
    fx.completed(21, true, datetime!(2025-03-01 11:00 UTC)).await;
    let untouched = fx.completed(30, false, datetime!(2025-03-01 10:00 UTC)).await;

    assert_eq!(fx.repository.invalidate_by_owner(1).await.unwrap(), 3);
    assert_eq!(fx.repository.get_latest_by_subject(20).await.unwrap(), None);
    assert_eq!(fx.repository.get_latest_by_subject(21).await.unwrap(), None);
    assert_eq!(
        fx.repository.get_latest_by_subject(30).await.unwrap(),
        Some(untouched)
    );

    assert_eq!(fx.repository.delete_all_by_owner(2).await.unwrap(), 1);
    assert!(fx.store.rows_for_subject(30).await.is_empty());
    assert_eq!(fx.repository.delete_all_by_owner(99).await.unwrap(), 0);
}

#[tokio::test]
async fn ensure_idempotency_reports_whether_a_row_was_created() {
    let fx = fixture();
    let request = NewModerationTask::pending(50);

    assert!(fx.repository.ensure_idempotency(&request).await.unwrap());
    assert!(!fx.repository.ensure_idempotency(&request).await.unwrap());
    assert_eq!(fx.store.rows_for_subject(50).await.len(), 1);
}

#[tokio::test]
async fn bulk_reads_come_from_the_store() {
    let fx = fixture();
    let first = fx.pending(60).await;
    let second = fx.completed(61, false, datetime!(2025-03-01 10:00 UTC)).await;

    let many = fx
        .repository
        .get_many(&[second.task_id, 999, first.task_id])
        .await
        .unwrap();
    assert_eq!(many, vec![second.clone(), first.clone()]);

    let recent = fx.repository.list_recent(1).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].task_id, second.task_id);
}

#[tokio::test]
async fn cache_outage_surfaces_after_the_store_write() {
    let fx = fixture();
    let task = fx.pending(70).await;
    fx.cache.set_unavailable(true);

    let err = fx
        .repository
        .update(task.task_id, &TaskChanges::completed(false, 0.2))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Cache(CacheError::Unavailable(_))));
    assert!(err.is_retryable());
    assert_eq!(
        fx.store.rows_for_subject(70).await[0].status,
        ModerationStatus::Completed
    );

    assert!(fx.repository.get_latest_by_subject(70).await.is_err());
    fx.cache.set_unavailable(false);
    assert!(fx.repository.get_latest_by_subject(70).await.unwrap().is_some());
}

#[tokio::test]
async fn inconsistent_changes_are_rejected_before_the_store() {
    let fx = fixture();
    let task = fx.pending(71).await;
    let changes = TaskChanges {
        error_message: Some("should not be here".to_string()),
        ..TaskChanges::completed(true, 0.9)
    };

    let err = fx.repository.update(task.task_id, &changes).await.unwrap_err();
    assert!(matches!(err, DomainError::Unexpected(_)));
    assert_eq!(
        fx.store.rows_for_subject(71).await[0].status,
        ModerationStatus::Pending
    );
}

/// Store whose `update` for one task id is held back for a fixed delay.
struct DelayedStore {
    inner: InMemoryModerationStore,
    delays: Vec<(i64, Duration)>,
}

impl ModerationStore for DelayedStore {
    fn insert(&self, task: &NewModerationTask) -> BoxFuture<'_, DomainResult<ModerationTask>> {
        self.inner.insert(task)
    }

    fn insert_if_absent(&self, task: &NewModerationTask) -> BoxFuture<'_, DomainResult<bool>> {
        self.inner.insert_if_absent(task)
    }

    fn get(&self, task_id: i64) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>> {
        self.inner.get(task_id)
    }

    fn get_many(&self, task_ids: &[i64]) -> BoxFuture<'_, DomainResult<Vec<ModerationTask>>> {
        self.inner.get_many(task_ids)
    }

    fn list_recent(&self, limit: usize) -> BoxFuture<'_, DomainResult<Vec<ModerationTask>>> {
        self.inner.list_recent(limit)
    }

    fn latest_by_subject(
        &self,
        subject_id: i64,
    ) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>> {
        self.inner.latest_by_subject(subject_id)
    }

    fn latest_completed_by_subject(
        &self,
        subject_id: i64,
    ) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>> {
        self.inner.latest_completed_by_subject(subject_id)
    }

    fn update(
        &self,
        task_id: i64,
        changes: &TaskChanges,
    ) -> BoxFuture<'_, DomainResult<ModerationTask>> {
        let delay = self
            .delays
            .iter()
            .find(|(id, _)| *id == task_id)
            .map(|(_, delay)| *delay)
            .unwrap_or_default();
        let changes = changes.clone();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            self.inner.update(task_id, &changes).await
        })
    }

    fn delete(&self, task_id: i64) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>> {
        self.inner.delete(task_id)
    }

    fn delete_by_subject(
        &self,
        subject_id: i64,
    ) -> BoxFuture<'_, DomainResult<Vec<ModerationTask>>> {
        self.inner.delete_by_subject(subject_id)
    }
}

async fn race_updates(first_delay: Duration, second_delay: Duration) -> (i64, i64, i64) {
    let inner = InMemoryModerationStore::new();
    let first = inner.insert(&NewModerationTask::pending(80)).await.unwrap();
    let second = inner.insert(&NewModerationTask::pending(80)).await.unwrap();
    let cache = InMemoryResultCache::new();
    let repository = ResultRepository::new(
        Arc::new(DelayedStore {
            inner,
            delays: vec![(first.task_id, first_delay), (second.task_id, second_delay)],
        }),
        Arc::new(cache),
        Arc::new(InMemorySubjectDirectory::new()),
        CachePolicy::default(),
    );

    let first_changes = TaskChanges::completed(true, 0.9);
    let second_changes = TaskChanges::completed(false, 0.1);
    let (a, b) = tokio::join!(
        repository.update(first.task_id, &first_changes),
        repository.update(second.task_id, &second_changes),
    );
    a.unwrap();
    b.unwrap();

    let latest = repository.get_latest_by_subject(80).await.unwrap().unwrap();
    (first.task_id, second.task_id, latest.task_id)
}

#[tokio::test(start_paused = true)]
async fn latest_pointer_is_last_writer_wins() {
    let (first, _, latest) =
        race_updates(Duration::from_millis(50), Duration::from_millis(10)).await;
    assert_eq!(latest, first, "the later landing write owns the pointer");

    let (_, second, latest) =
        race_updates(Duration::from_millis(10), Duration::from_millis(50)).await;
    assert_eq!(latest, second);
}
