mod consumer;
mod observability;
mod processor;
mod supervisor;


use std::net::SocketAddr;
use std::sync::Arc;

use moderation_domain::classifier::{ClassifierHandle, LogisticClassifier, PredictionService};
use moderation_domain::ports::queue::{DeadLetterSink, MessageConsumer};
use moderation_domain::repository::ResultRepository;
use moderation_infra::cache::RedisResultCache;
use moderation_infra::queue::{RedisDeadLetterSink, RedisMessageQueue};
use moderation_infra::store::{PgModerationStore, connect_pool};
use moderation_infra::subjects::PgSubjectDirectory;
use moderation_infra::{config::AppConfig, logging::init_tracing};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::consumer::{CommitPolicy, ConsumerWorker};
use crate::processor::MessageProcessor;
use crate::supervisor::TaskSupervisor;

const REQUEUE_BATCH: usize = 1000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config, "moderation-worker")?;

    let metrics_addr: SocketAddr = config.metrics_addr.parse()?;
    observability::init_metrics(metrics_addr)?;

    let commit_policy: CommitPolicy = config.worker_commit_policy.parse()?;
    let model = LogisticClassifier::new(
        config.classifier_weights()?,
        config.classifier_bias,
        config.classifier_threshold,
    );

    let pool = connect_pool(&config).await?;
    let store = Arc::new(PgModerationStore::new(pool.clone()));
    let subjects = Arc::new(PgSubjectDirectory::new(pool));
    let cache = Arc::new(RedisResultCache::connect(&config.redis_url).await?);
    let queue =
        RedisMessageQueue::connect_with_prefix(&config.redis_url, &config.queue_prefix).await?;
    let dead_letters = Arc::new(
        RedisDeadLetterSink::connect_with_prefix(&config.redis_url, &config.queue_prefix).await?,
    );

    let requeued = queue.requeue_in_flight(REQUEUE_BATCH).await?;
    if requeued > 0 {
        info!(requeued, "returned uncommitted messages to the request queue");
    }

    let repository =
        ResultRepository::new(store, cache, subjects.clone(), config.cache_policy());
    let predictions = PredictionService::new(
        subjects,
        Arc::new(ClassifierHandle::loaded(Arc::new(model))),
    );
    let processor = Arc::new(MessageProcessor::new(
        repository,
        predictions,
        dead_letters.clone(),
        config.retry_policy(),
    ));

    let supervisor = TaskSupervisor::new();
    let consumer: Arc<dyn MessageConsumer> = Arc::new(queue.clone());
    let worker = ConsumerWorker::new(
        consumer.clone(),
        processor,
        supervisor.clone(),
        commit_policy,
        config.poll_timeout(),
    );

    let shutdown = CancellationToken::new();
    let sampler = tokio::spawn(observability::sample_queue_depths(
        queue,
        shutdown.clone(),
    ));
    let consume_loop = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    info!(
        queue_prefix = %config.queue_prefix,
        max_retries = config.worker_max_retries,
        "moderation worker started"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    shutdown.cancel();
    consume_loop.await?;
    let abandoned = supervisor.drain(config.shutdown_grace()).await;

    if let Err(err) = consumer.close().await {
        error!(error = %err, "failed to close request consumer");
    }
    if let Err(err) = dead_letters.close().await {
        error!(error = %err, "failed to close dead-letter sink");
    }
    sampler.await?;

    info!(abandoned, "moderation worker stopped");
    Ok(())
}
