use std::time::Duration;

use thiserror::Error;

use super::BoxFuture;
use crate::jobs::{DeadLetterMessage, QueueMessage};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("queue serialization error: {0}")]
    Serialization(String),
    #[error("queue operation failed: {0}")]
    Operation(String),
}

/// A polled message plus the opaque handle needed to commit it.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub receipt: String,
    pub message: QueueMessage,
}

pub trait MessageConsumer: Send + Sync {
    fn poll(&self, timeout: Duration) -> BoxFuture<'_, Result<Option<Delivery>, QueueError>>;
    fn commit(&self, delivery: &Delivery) -> BoxFuture<'_, Result<(), QueueError>>;
    fn close(&self) -> BoxFuture<'_, Result<(), QueueError>>;
}

pub trait MessagePublisher: Send + Sync {
    fn publish(&self, message: &QueueMessage) -> BoxFuture<'_, Result<(), QueueError>>;
}

pub trait DeadLetterSink: Send + Sync {
    fn send(&self, message: &DeadLetterMessage) -> BoxFuture<'_, Result<(), QueueError>>;
    fn close(&self) -> BoxFuture<'_, Result<(), QueueError>>;
}
