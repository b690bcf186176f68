//! In-process adapters for every port. Used by tests and local runs without Redis or
//! Postgres.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;

use crate::DomainResult;
use crate::classifier::SubjectFeatures;
use crate::error::DomainError;
use crate::jobs::{DeadLetterMessage, QueueMessage};
use crate::moderation::{ModerationStatus, ModerationTask, NewModerationTask, TaskChanges};
use crate::ports::BoxFuture;
use crate::ports::cache::{CacheError, ResultCache};
use crate::ports::queue::{
    DeadLetterSink, Delivery, MessageConsumer, MessagePublisher, QueueError,
};
use crate::ports::store::ModerationStore;
use crate::ports::subjects::SubjectDirectory;

#[derive(Clone, Default)]
pub struct InMemoryModerationStore {
    rows: Arc<RwLock<BTreeMap<i64, ModerationTask>>>,
    next_id: Arc<AtomicI64>,
    reads: Arc<AtomicUsize>,
}

impl InMemoryModerationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of point/latest lookups served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub async fn rows_for_subject(&self, subject_id: i64) -> Vec<ModerationTask> {
        self.rows
            .read()
            .await
            .values()
            .filter(|task| task.subject_id == subject_id)
            .cloned()
            .collect()
    }

    fn build_row(&self, task: NewModerationTask) -> ModerationTask {
        ModerationTask {
            task_id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            subject_id: task.subject_id,
            status: task.status,
            is_violation: task.is_violation,
            probability: task.probability,
            error_message: task.error_message,
            created_at: OffsetDateTime::now_utc(),
            processed_at: None,
        }
    }

    fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    fn latest_matching(
        rows: &BTreeMap<i64, ModerationTask>,
        subject_id: i64,
        completed_only: bool,
    ) -> Option<ModerationTask> {
        rows.values()
            .filter(|task| task.subject_id == subject_id && task.processed_at.is_some())
            .filter(|task| !completed_only || task.status == ModerationStatus::Completed)
            .max_by(|left, right| {
                left.processed_at
                    .cmp(&right.processed_at)
                    .then_with(|| left.task_id.cmp(&right.task_id))
            })
            .cloned()
    }
}

impl ModerationStore for InMemoryModerationStore {
    fn insert(&self, task: &NewModerationTask) -> BoxFuture<'_, DomainResult<ModerationTask>> {
        let task = task.clone();
        Box::pin(async move {
            let row = self.build_row(task);
            self.rows.write().await.insert(row.task_id, row.clone());
            Ok(row)
        })
    }

    fn insert_if_absent(&self, task: &NewModerationTask) -> BoxFuture<'_, DomainResult<bool>> {
        let task = task.clone();
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            let exists = rows
                .values()
                .any(|row| row.subject_id == task.subject_id && row.status == task.status);
            if exists {
                return Ok(false);
            }
            let row = self.build_row(task);
            rows.insert(row.task_id, row);
            Ok(true)
        })
    }

    fn get(&self, task_id: i64) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>> {
        Box::pin(async move {
            self.record_read();
            Ok(self.rows.read().await.get(&task_id).cloned())
        })
    }

    fn get_many(&self, task_ids: &[i64]) -> BoxFuture<'_, DomainResult<Vec<ModerationTask>>> {
        let task_ids = task_ids.to_vec();
        Box::pin(async move {
            self.record_read();
            let rows = self.rows.read().await;
            Ok(task_ids
                .iter()
                .filter_map(|task_id| rows.get(task_id).cloned())
                .collect())
        })
    }

    fn list_recent(&self, limit: usize) -> BoxFuture<'_, DomainResult<Vec<ModerationTask>>> {
        Box::pin(async move {
            self.record_read();
            let mut rows: Vec<_> = self.rows.read().await.values().cloned().collect();
            rows.sort_by(|left, right| {
                right
                    .created_at
                    .cmp(&left.created_at)
                    .then_with(|| right.task_id.cmp(&left.task_id))
            });
            rows.truncate(limit);
            Ok(rows)
        })
    }

    fn latest_by_subject(
        &self,
        subject_id: i64,
    ) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>> {
        Box::pin(async move {
            self.record_read();
            Ok(Self::latest_matching(&*self.rows.read().await, subject_id, false))
        })
    }

    fn latest_completed_by_subject(
        &self,
        subject_id: i64,
    ) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>> {
        Box::pin(async move {
            self.record_read();
            Ok(Self::latest_matching(&*self.rows.read().await, subject_id, true))
        })
    }

    fn update(
        &self,
        task_id: i64,
        changes: &TaskChanges,
    ) -> BoxFuture<'_, DomainResult<ModerationTask>> {
        let changes = changes.clone();
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            let row = rows
                .get_mut(&task_id)
                .ok_or_else(|| DomainError::task_not_found(task_id))?;
            row.apply(&changes);
            Ok(row.clone())
        })
    }

    fn delete(&self, task_id: i64) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>> {
        Box::pin(async move { Ok(self.rows.write().await.remove(&task_id)) })
    }

    fn delete_by_subject(
        &self,
        subject_id: i64,
    ) -> BoxFuture<'_, DomainResult<Vec<ModerationTask>>> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            let task_ids: Vec<i64> = rows
                .values()
                .filter(|task| task.subject_id == subject_id)
                .map(|task| task.task_id)
                .collect();
            Ok(task_ids
                .into_iter()
                .filter_map(|task_id| rows.remove(&task_id))
                .collect())
        })
    }
}

/// Expiry used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn far_future(now: Instant) -> Instant {
    now.checked_add(FAR_FUTURE).unwrap_or(now)
}

#[derive(Clone, Debug)]
struct CacheEntry {
    payload: String,
    expires_at: Instant,
}

/// TTL-bounded key/value mirror that stores serialized snapshots like Redis does.
#[derive(Clone, Default)]
pub struct InMemoryResultCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails with `CacheError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.ttl_remaining(key).await.is_some()
    }

    pub async fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock().await;
        let entry = entries.get(key)?;
        let now = Instant::now();
        (entry.expires_at > now).then(|| entry.expires_at - now)
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

impl ResultCache for InMemoryResultCache {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<ModerationTask>, CacheError>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check_available()?;
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get(&key) else {
                return Ok(None);
            };
            if Instant::now() >= entry.expires_at {
                entries.remove(&key);
                return Ok(None);
            }
            serde_json::from_str(&entry.payload)
                .map(Some)
                .map_err(|err| CacheError::Serialization(err.to_string()))
        })
    }

    fn set(
        &self,
        key: &str,
        task: &ModerationTask,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = key.to_string();
        let payload = serde_json::to_string(task);
        Box::pin(async move {
            self.check_available()?;
            let payload = payload.map_err(|err| CacheError::Serialization(err.to_string()))?;
            let now = Instant::now();
            let expires_at = now.checked_add(ttl).unwrap_or_else(|| far_future(now));
            self.entries
                .lock()
                .await
                .insert(key, CacheEntry { payload, expires_at });
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check_available()?;
            self.entries.lock().await.remove(&key);
            Ok(())
        })
    }

    fn delete_many(&self, keys: &[String]) -> BoxFuture<'_, Result<(), CacheError>> {
        let keys = keys.to_vec();
        Box::pin(async move {
            self.check_available()?;
            let mut entries = self.entries.lock().await;
            for key in keys {
                entries.remove(&key);
            }
            Ok(())
        })
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueueMessage>,
    in_flight: HashMap<String, QueueMessage>,
    dead_letters: Vec<DeadLetterMessage>,
    committed: usize,
    next_receipt: u64,
    consumer_closed: bool,
    sink_closed: bool,
}

/// Request topic and dead-letter topic in one process-local queue.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    arrivals: Arc<Notify>,
    reject_dead_letters: Arc<AtomicBool>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every dead-letter publish fail.
    pub fn reject_dead_letters(&self, reject: bool) {
        self.reject_dead_letters.store(reject, Ordering::SeqCst);
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterMessage> {
        self.state.lock().await.dead_letters.clone()
    }

    pub async fn committed(&self) -> usize {
        self.state.lock().await.committed
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    pub async fn ready(&self) -> Vec<QueueMessage> {
        self.state.lock().await.ready.iter().cloned().collect()
    }

    pub async fn is_closed(&self) -> bool {
        let state = self.state.lock().await;
        state.consumer_closed && state.sink_closed
    }

    async fn take_ready(&self) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state.lock().await;
        if state.consumer_closed {
            return Err(QueueError::Unavailable("consumer closed".to_string()));
        }
        let Some(message) = state.ready.pop_front() else {
            return Ok(None);
        };
        state.next_receipt += 1;
        let receipt = format!("delivery-{}", state.next_receipt);
        state.in_flight.insert(receipt.clone(), message.clone());
        Ok(Some(Delivery { receipt, message }))
    }
}

impl MessageConsumer for InMemoryQueue {
    fn poll(&self, timeout: Duration) -> BoxFuture<'_, Result<Option<Delivery>, QueueError>> {
        Box::pin(async move {
            if let Some(delivery) = self.take_ready().await? {
                return Ok(Some(delivery));
            }
            let _ = tokio::time::timeout(timeout, self.arrivals.notified()).await;
            self.take_ready().await
        })
    }

    fn commit(&self, delivery: &Delivery) -> BoxFuture<'_, Result<(), QueueError>> {
        let receipt = delivery.receipt.clone();
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.in_flight.remove(&receipt).is_none() {
                return Err(QueueError::Operation(format!(
                    "unknown delivery receipt {receipt}"
                )));
            }
            state.committed += 1;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(async move {
            self.state.lock().await.consumer_closed = true;
            Ok(())
        })
    }
}

impl MessagePublisher for InMemoryQueue {
    fn publish(&self, message: &QueueMessage) -> BoxFuture<'_, Result<(), QueueError>> {
        let message = message.clone();
        Box::pin(async move {
            self.state.lock().await.ready.push_back(message);
            self.arrivals.notify_one();
            Ok(())
        })
    }
}

impl DeadLetterSink for InMemoryQueue {
    fn send(&self, message: &DeadLetterMessage) -> BoxFuture<'_, Result<(), QueueError>> {
        let message = message.clone();
        Box::pin(async move {
            if self.reject_dead_letters.load(Ordering::SeqCst) {
                return Err(QueueError::Unavailable("dead-letter topic rejected".to_string()));
            }
            let mut state = self.state.lock().await;
            if state.sink_closed {
                return Err(QueueError::Unavailable("dead-letter sink closed".to_string()));
            }
            state.dead_letters.push(message);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(async move {
            self.state.lock().await.sink_closed = true;
            Ok(())
        })
    }
}

#[derive(Clone, Default)]
pub struct InMemorySubjectDirectory {
    subjects: Arc<RwLock<HashMap<i64, SubjectFeatures>>>,
}

impl InMemorySubjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, subject: SubjectFeatures) {
        self.subjects
            .write()
            .await
            .insert(subject.subject_id, subject);
    }

    pub async fn remove(&self, subject_id: i64) {
        self.subjects.write().await.remove(&subject_id);
    }
}

impl SubjectDirectory for InMemorySubjectDirectory {
    fn prediction_input(&self, subject_id: i64) -> BoxFuture<'_, DomainResult<SubjectFeatures>> {
        Box::pin(async move {
            self.subjects
                .read()
                .await
                .get(&subject_id)
                .cloned()
                .ok_or_else(|| DomainError::not_found(format!("item {subject_id}")))
        })
    }

    fn active_subjects_by_owner(&self, owner_id: i64) -> BoxFuture<'_, DomainResult<Vec<i64>>> {
        Box::pin(async move {
            let mut subject_ids: Vec<i64> = self
                .subjects
                .read()
                .await
                .values()
                .filter(|subject| subject.owner_id == owner_id)
                .map(|subject| subject.subject_id)
                .collect();
            subject_ids.sort_unstable();
            Ok(subject_ids)
        })
    }
}
