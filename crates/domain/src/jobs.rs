use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;

pub const MODERATION_REQUEST_EVENT: &str = "moderation_request";
pub const MESSAGE_SOURCE: &str = "advertisement_service";
pub const MESSAGE_VERSION: &str = "1.0";

fn default_event_type() -> String {
    MODERATION_REQUEST_EVENT.to_string()
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// A moderation request as it travels through the request topic.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueueMessage {
    pub task_id: i64,
    #[serde(rename = "item_id")]
    pub subject_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default = "default_event_type")]
    pub event_type: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_retry: Option<OffsetDateTime>,
}

impl QueueMessage {
    pub fn moderation_request(task_id: i64, subject_id: i64) -> Self {
        Self {
            task_id,
            subject_id,
            timestamp: OffsetDateTime::now_utc(),
            event_type: default_event_type(),
            metadata: json!({
                "source": MESSAGE_SOURCE,
                "version": MESSAGE_VERSION,
            }),
            retry_count: 0,
            last_retry: None,
        }
    }

    pub fn next_retry(&self) -> Self {
        let mut retry = self.clone();
        retry.retry_count = self.retry_count.saturating_add(1);
        retry.last_retry = Some(OffsetDateTime::now_utc());
        retry
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterMessage {
    pub original: QueueMessage,
    pub error: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub retry_count: u32,
}

impl DeadLetterMessage {
    pub fn new(original: QueueMessage, error: impl Into<String>, retry_count: u32) -> Self {
        Self {
            original,
            error: error.into(),
            timestamp: OffsetDateTime::now_utc(),
            retry_count,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(5),
            backoff_multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// `initial_delay * backoff_multiplier ^ retry_count`, saturating.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = self.backoff_multiplier.saturating_pow(retry_count);
        self.initial_delay.saturating_mul(factor)
    }

    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}
