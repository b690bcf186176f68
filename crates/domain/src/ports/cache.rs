use std::time::Duration;

use thiserror::Error;

use super::BoxFuture;
use crate::moderation::ModerationTask;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("result cache unavailable: {0}")]
    Unavailable(String),
    #[error("result cache serialization error: {0}")]
    Serialization(String),
    #[error("result cache operation failed: {0}")]
    Operation(String),
}

impl CacheError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub fn task_key(task_id: i64) -> String {
    format!("task:{task_id}")
}

pub fn subject_key(subject_id: i64) -> String {
    format!("item:{subject_id}")
}

/// Volatile mirror of completed verdicts.
///
/// `set` must apply the value and its TTL as one atomic write.
pub trait ResultCache: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<ModerationTask>, CacheError>>;
    fn set(
        &self,
        key: &str,
        task: &ModerationTask,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), CacheError>>;
    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), CacheError>>;
    fn delete_many(&self, keys: &[String]) -> BoxFuture<'_, Result<(), CacheError>>;
}
