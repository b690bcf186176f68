//! Redis list-backed request topic.
//!
//! Producers `LPUSH` onto `{prefix}:requests`; the consumer moves one payload at a
//! time into `{prefix}:requests:processing` with `BRPOPLPUSH`, so an uncommitted
//! message survives a crash. Committing removes the payload from the in-flight list.
//! Dead letters go to `{prefix}:requests:dlq`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use moderation_domain::jobs::{DeadLetterMessage, QueueMessage};
use moderation_domain::ports::BoxFuture;
use moderation_domain::ports::queue::{
    DeadLetterSink, Delivery, MessageConsumer, MessagePublisher, QueueError,
};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::cache::is_connectivity_error;

pub const DEFAULT_PREFIX: &str = "moderation";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueKeys {
    pub ready: String,
    pub processing: String,
    pub dead_letter: String,
}

impl QueueKeys {
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            ready: format!("{prefix}:requests"),
            processing: format!("{prefix}:requests:processing"),
            dead_letter: format!("{prefix}:requests:dlq"),
        }
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepths {
    pub ready: u64,
    pub processing: u64,
    pub dead_letter: u64,
}

fn map_redis_error(err: redis::RedisError) -> QueueError {
    if is_connectivity_error(&err) {
        QueueError::Unavailable(err.to_string())
    } else {
        QueueError::Operation(err.to_string())
    }
}

async fn open_manager(redis_url: &str) -> Result<ConnectionManager, QueueError> {
    let client =
        redis::Client::open(redis_url).map_err(|err| QueueError::Unavailable(err.to_string()))?;
    ConnectionManager::new(client)
        .await
        .map_err(|err| QueueError::Unavailable(err.to_string()))
}

#[derive(Clone)]
pub struct RedisMessageQueue {
    manager: ConnectionManager,
    // BRPOPLPUSH parks its connection; keep it off the command connection.
    poll_manager: ConnectionManager,
    keys: QueueKeys,
    closed: Arc<AtomicBool>,
}

impl RedisMessageQueue {
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(redis_url: &str, prefix: &str) -> Result<Self, QueueError> {
        Ok(Self {
            manager: open_manager(redis_url).await?,
            poll_manager: open_manager(redis_url).await?,
            keys: QueueKeys::with_prefix(prefix),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    fn serialize(message: &QueueMessage) -> Result<String, QueueError> {
        serde_json::to_string(message).map_err(|err| QueueError::Serialization(err.to_string()))
    }

    fn deserialize(payload: &str) -> Result<QueueMessage, QueueError> {
        serde_json::from_str(payload).map_err(|err| QueueError::Serialization(err.to_string()))
    }

    /// Moves up to `limit` payloads left in flight by a previous process back to the
    /// ready list.
    pub async fn requeue_in_flight(&self, limit: usize) -> Result<usize, QueueError> {
        if limit == 0 {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        let payloads: Vec<String> = conn
            .lrange(&self.keys.processing, 0, limit.saturating_sub(1) as isize)
            .await
            .map_err(map_redis_error)?;
        if payloads.is_empty() {
            return Ok(0);
        }

        let mut pipeline = redis::pipe();
        pipeline.atomic();
        pipeline
            .cmd("RPUSH")
            .arg(&self.keys.ready)
            .arg(payloads.clone());
        pipeline
            .cmd("LTRIM")
            .arg(&self.keys.processing)
            .arg(payloads.len() as i64)
            .arg(-1);
        let _: Vec<redis::Value> = pipeline
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(payloads.len())
    }

    pub async fn depths(&self) -> Result<QueueDepths, QueueError> {
        let mut conn = self.manager.clone();
        let ready: u64 = conn.llen(&self.keys.ready).await.map_err(map_redis_error)?;
        let processing: u64 = conn
            .llen(&self.keys.processing)
            .await
            .map_err(map_redis_error)?;
        let dead_letter: u64 = conn
            .llen(&self.keys.dead_letter)
            .await
            .map_err(map_redis_error)?;
        Ok(QueueDepths {
            ready,
            processing,
            dead_letter,
        })
    }

    async fn discard_in_flight(&self, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .lrem(&self.keys.processing, 1, payload)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}

impl MessageConsumer for RedisMessageQueue {
    fn poll(&self, timeout: Duration) -> BoxFuture<'_, Result<Option<Delivery>, QueueError>> {
        let timeout_secs = timeout.as_secs().max(1);
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Unavailable("consumer closed".to_string()));
            }
            let mut conn = self.poll_manager.clone();
            let payload: Option<String> = redis::cmd("BRPOPLPUSH")
                .arg(&self.keys.ready)
                .arg(&self.keys.processing)
                .arg(timeout_secs)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            let Some(payload) = payload else {
                return Ok(None);
            };

            match Self::deserialize(&payload) {
                Ok(message) => Ok(Some(Delivery {
                    receipt: payload,
                    message,
                })),
                Err(err) => {
                    tracing::warn!(error = %err, payload = %payload, "dropping undecodable message");
                    metrics::counter!("moderation_queue_poison_messages_total").increment(1);
                    self.discard_in_flight(&payload).await?;
                    Ok(None)
                }
            }
        })
    }

    fn commit(&self, delivery: &Delivery) -> BoxFuture<'_, Result<(), QueueError>> {
        let receipt = delivery.receipt.clone();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let removed: i64 = conn
                .lrem(&self.keys.processing, 1, &receipt)
                .await
                .map_err(map_redis_error)?;
            if removed == 0 {
                tracing::warn!(task_id = ?task_id_hint(&receipt), "committed message was not in flight");
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

impl MessagePublisher for RedisMessageQueue {
    fn publish(&self, message: &QueueMessage) -> BoxFuture<'_, Result<(), QueueError>> {
        let payload = Self::serialize(message);
        Box::pin(async move {
            let payload = payload?;
            let mut conn = self.manager.clone();
            let _: i64 = conn
                .lpush(&self.keys.ready, payload)
                .await
                .map_err(map_redis_error)?;
            Ok(())
        })
    }
}

fn task_id_hint(payload: &str) -> Option<i64> {
    serde_json::from_str::<serde_json::Value>(payload)
        .ok()
        .and_then(|value| value.get("task_id").and_then(serde_json::Value::as_i64))
}

#[derive(Clone)]
pub struct RedisDeadLetterSink {
    manager: ConnectionManager,
    key: String,
    closed: Arc<AtomicBool>,
}

impl RedisDeadLetterSink {
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(redis_url: &str, prefix: &str) -> Result<Self, QueueError> {
        Ok(Self {
            manager: open_manager(redis_url).await?,
            key: QueueKeys::with_prefix(prefix).dead_letter,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl DeadLetterSink for RedisDeadLetterSink {
    fn send(&self, message: &DeadLetterMessage) -> BoxFuture<'_, Result<(), QueueError>> {
        let payload = serde_json::to_string(message)
            .map_err(|err| QueueError::Serialization(err.to_string()));
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Unavailable("dead-letter sink closed".to_string()));
            }
            let payload = payload?;
            let mut conn = self.manager.clone();
            let _: i64 = conn
                .lpush(&self.key, payload)
                .await
                .map_err(map_redis_error)?;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_derive_from_the_prefix() {
        let keys = QueueKeys::with_prefix("staging");
        assert_eq!(keys.ready, "staging:requests");
        assert_eq!(keys.processing, "staging:requests:processing");
        assert_eq!(keys.dead_letter, "staging:requests:dlq");
        assert_eq!(QueueKeys::default(), QueueKeys::with_prefix("moderation"));
    }

    #[test]
    fn receipt_is_the_exact_payload_that_was_moved() {
        let message = QueueMessage::moderation_request(5, 6);
        let payload = RedisMessageQueue::serialize(&message).unwrap();
        assert_eq!(RedisMessageQueue::deserialize(&payload).unwrap(), message);
        assert_eq!(task_id_hint(&payload), Some(5));
        assert_eq!(task_id_hint("not json"), None);
    }

    #[test]
    fn undecodable_payload_is_a_serialization_error() {
        let err = RedisMessageQueue::deserialize("{\"task_id\": \"x\"}").unwrap_err();
        assert!(matches!(err, QueueError::Serialization(_)));
    }
}
