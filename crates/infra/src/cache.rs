use std::time::Duration;

use moderation_domain::moderation::ModerationTask;
use moderation_domain::ports::BoxFuture;
use moderation_domain::ports::cache::{CacheError, ResultCache};
use redis::AsyncCommands;
use redis::Value;
use redis::aio::ConnectionManager;

#[derive(Clone)]
pub struct RedisResultCache {
    manager: ConnectionManager,
}

impl RedisResultCache {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(redis_url).map_err(|err| CacheError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| CacheError::Unavailable(err.to_string()))?;
        Ok(Self { manager })
    }

    fn serialize(task: &ModerationTask) -> Result<String, CacheError> {
        serde_json::to_string(task).map_err(|err| CacheError::Serialization(err.to_string()))
    }

    fn deserialize(payload: &str) -> Result<ModerationTask, CacheError> {
        serde_json::from_str(payload).map_err(|err| CacheError::Serialization(err.to_string()))
    }

    /// Whole seconds, at least one; Redis rejects a zero expiry.
    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

pub(crate) fn map_redis_error(err: redis::RedisError) -> CacheError {
    if is_connectivity_error(&err) {
        CacheError::Unavailable(err.to_string())
    } else {
        CacheError::Operation(err.to_string())
    }
}

pub(crate) fn is_connectivity_error(err: &redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
}

impl ResultCache for RedisResultCache {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<ModerationTask>, CacheError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let value: Option<String> = conn.get(&key).await.map_err(map_redis_error)?;
            match value {
                Some(payload) => {
                    metrics::counter!("moderation_cache_lookups_total", "result" => "hit")
                        .increment(1);
                    Ok(Some(Self::deserialize(&payload)?))
                }
                None => {
                    metrics::counter!("moderation_cache_lookups_total", "result" => "miss")
                        .increment(1);
                    Ok(None)
                }
            }
        })
    }

    fn set(
        &self,
        key: &str,
        task: &ModerationTask,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = key.to_string();
        let payload = Self::serialize(task);
        let ttl_secs = Self::ttl_secs(ttl);
        Box::pin(async move {
            let payload = payload?;
            let mut conn = self.manager.clone();

            let mut pipeline = redis::pipe();
            pipeline.atomic();
            pipeline.cmd("SET").arg(&key).arg(payload);
            pipeline.cmd("EXPIRE").arg(&key).arg(ttl_secs);

            let _: Vec<Value> = pipeline
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: i64 = conn.del(&key).await.map_err(map_redis_error)?;
            Ok(())
        })
    }

    fn delete_many(&self, keys: &[String]) -> BoxFuture<'_, Result<(), CacheError>> {
        let keys = keys.to_vec();
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(());
            }
            let mut conn = self.manager.clone();
            let _: i64 = conn.del(&keys).await.map_err(map_redis_error)?;
            Ok(())
        })
    }
}
