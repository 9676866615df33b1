use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use photo_pipeline::{
    config::AppConfig,
    db::{self, PgJobStore},
    services::{
        notification::{NotificationDispatcher, RedisNotificationSink},
        orchestrator::JobOrchestrator,
        provider::{
            openai::OpenAiAdapter, workers_ai::WorkersAiAdapter, ProviderGateway, ProviderKind,
        },
        queue::RedisQueue,
        storage::R2Client,
        worker::QueueWorker,
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting photo pipeline worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let pipeline = config.pipeline();

    // The worker has no HTTP server; the exporter serves /metrics on its own listener (:9000).
    PrometheusBuilder::new()
        .install()
        .expect("Failed to install Prometheus exporter");
    metrics::describe_counter!("pipeline_jobs_completed_total", "Jobs that reached COMPLETED");
    metrics::describe_counter!("pipeline_jobs_failed_total", "Jobs that reached FAILED");
    metrics::describe_counter!(
        "pipeline_messages_rejected_total",
        "Upload events acknowledged without processing because they were malformed"
    );
    metrics::describe_counter!(
        "pipeline_circuit_open_total",
        "Times a provider circuit breaker opened"
    );
    metrics::describe_counter!(
        "pipeline_notifications_failed_total",
        "Lifecycle notifications dropped after retries"
    );
    metrics::describe_histogram!(
        "pipeline_provider_seconds",
        "Latency of a single provider attempt"
    );
    metrics::describe_gauge!("pipeline_queue_depth", "Upload events waiting to be received");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Initializing services");
    let r2_client = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");

    let queue = RedisQueue::new(&config.redis_url, pipeline.queue.clone())
        .expect("Failed to initialize upload queue");

    let sink = RedisNotificationSink::new(&config.redis_url)
        .expect("Failed to initialize notification sink");
    let notifier = NotificationDispatcher::new(Box::new(sink), pipeline.notify.clone());

    let mut workers_ai = WorkersAiAdapter::new(config.cf_account_id.clone(), config.cf_api_token.clone());
    if let Some(model) = &config.cf_model {
        workers_ai = workers_ai.with_model(model.clone());
    }
    let mut gateway =
        ProviderGateway::new(pipeline.gateway.clone()).with_adapter(ProviderKind::WorkersAi, Arc::new(workers_ai));

    match &config.openai_api_key {
        Some(key) => {
            let mut openai = OpenAiAdapter::new(config.openai_base_url.clone(), key.clone());
            if let Some(model) = &config.openai_model {
                openai = openai.with_model(model.clone());
            }
            gateway = gateway.with_adapter(ProviderKind::OpenAi, Arc::new(openai));
        }
        None => tracing::info!("OPENAI_API_KEY not set, OpenAI provider disabled"),
    }

    let orchestrator = JobOrchestrator::new(
        Arc::new(PgJobStore::new(db_pool)),
        Arc::new(r2_client),
        Arc::new(gateway),
        Arc::new(notifier),
        pipeline.orchestrator.clone(),
    );

    let worker = QueueWorker::new(Arc::new(queue), Arc::new(orchestrator), pipeline.worker.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received, finishing in-flight messages");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                // keep the sender alive so the worker is not stopped
                std::future::pending::<()>().await;
            }
        }
    });

    worker.run(shutdown_rx).await;
}
