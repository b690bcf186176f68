use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use moderation_infra::queue::RedisMessageQueue;
use tokio_util::sync::CancellationToken;

const MESSAGES_PROCESSED_TOTAL: &str = "moderation_worker_messages_processed_total";
const MESSAGE_PROCESSING_DURATION_MS: &str = "moderation_worker_message_processing_duration_ms";
const RETRIES_SCHEDULED_TOTAL: &str = "moderation_worker_retries_scheduled_total";
const DEAD_LETTERS_TOTAL: &str = "moderation_worker_dead_letters_total";
const DEAD_LETTER_PUBLISH_FAILURES_TOTAL: &str =
    "moderation_worker_dead_letter_publish_failures_total";
const IN_FLIGHT_GAUGE: &str = "moderation_worker_in_flight";
const QUEUE_READY_GAUGE: &str = "moderation_worker_queue_ready_total";
const QUEUE_PROCESSING_GAUGE: &str = "moderation_worker_queue_processing_total";
const QUEUE_DEAD_LETTER_GAUGE: &str = "moderation_worker_queue_dead_letter_total";

const QUEUE_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

/// Installs the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(listen: SocketAddr) -> Result<()> {
    PrometheusBuilder::new().with_http_listener(listen).install()?;
    Ok(())
}

pub fn register_message_processed(outcome: &'static str, duration_ms: f64) {
    counter!(MESSAGES_PROCESSED_TOTAL, "outcome" => outcome).increment(1);
    histogram!(MESSAGE_PROCESSING_DURATION_MS, "outcome" => outcome).record(duration_ms.max(0.0));
}

pub fn register_retry_scheduled(retry_count: u32) {
    counter!(RETRIES_SCHEDULED_TOTAL, "attempt" => (retry_count + 1).to_string()).increment(1);
}

pub fn register_dead_letter(reason: &'static str, published: bool) {
    if published {
        counter!(DEAD_LETTERS_TOTAL, "reason" => reason).increment(1);
    } else {
        counter!(DEAD_LETTER_PUBLISH_FAILURES_TOTAL, "reason" => reason).increment(1);
    }
}

pub fn increment_in_flight() {
    gauge!(IN_FLIGHT_GAUGE).increment(1.0);
}

pub fn decrement_in_flight() {
    gauge!(IN_FLIGHT_GAUGE).decrement(1.0);
}

pub fn set_queue_depth_gauge(ready: u64, processing: u64, dead_letter: u64) {
    gauge!(QUEUE_READY_GAUGE).set(ready as f64);
    gauge!(QUEUE_PROCESSING_GAUGE).set(processing as f64);
    gauge!(QUEUE_DEAD_LETTER_GAUGE).set(dead_letter as f64);
}

/// Publishes list depths until `shutdown` fires.
pub async fn sample_queue_depths(queue: RedisMessageQueue, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(QUEUE_SAMPLE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match queue.depths().await {
            Ok(depths) => {
                set_queue_depth_gauge(depths.ready, depths.processing, depths.dead_letter)
            }
            Err(err) => tracing::debug!(error = %err, "queue depth sample failed"),
        }
    }
}
