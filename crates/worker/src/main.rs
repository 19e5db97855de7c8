//! Saga worker entry point.

use std::sync::Arc;

use saga::{SagaContext, SagaOrchestrator, StoreKind};
use saga_store::{InMemorySagaStateStore, PostgresSagaStateStore, SagaStateStore};
use saga_worker::{LogFormat, SagaTrigger, Worker, WorkerConfig, demo};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &WorkerConfig) {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn open_store(config: &WorkerConfig) -> Arc<dyn SagaStateStore> {
    match config.saga.store_kind {
        StoreKind::Memory => Arc::new(InMemorySagaStateStore::new()),
        StoreKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .expect("DATABASE_URL is validated by WorkerConfig");
            let store = PostgresSagaStateStore::connect(url)
                .await
                .expect("failed to connect to PostgreSQL");
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            Arc::new(store)
        }
    }
}

#[tokio::main]
async fn main() {
    // 1. Load configuration
    let config = WorkerConfig::from_env().expect("invalid configuration");

    // 2. Initialize tracing
    init_tracing(&config);

    // 3. Install Prometheus exporter
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(config.metrics_addr)
        .install()
        .expect("failed to install Prometheus exporter");
    tracing::info!(addr = %config.metrics_addr, "metrics listener started");

    // 4. Open the state store
    let store = open_store(&config).await;
    tracing::info!(store = ?config.saga.store_kind, "saga state store ready");

    // 5. Register the demo saga and start the worker
    let services = demo::DemoServices::default();
    let registry = demo::registry(&services).expect("failed to register demo steps");
    let definition = demo::definition(&registry).expect("invalid demo saga definition");
    let orchestrator = Arc::new(SagaOrchestrator::new(store, registry, config.saga.clone()));
    let worker = Worker::spawn(Arc::clone(&orchestrator), &config);

    // 6. Seed a few demo orders; the first shipment attempt hits a carrier outage
    services.shipping.fail_next(1).await;
    let triggers = worker.triggers();
    for order in demo::sample_orders() {
        let context = SagaContext::new(&order)
            .expect("demo order serializes")
            .with_correlation_id(order.order_id.clone());
        match orchestrator.create(&definition, context).await {
            Ok(saga_id) => {
                if let Err(err) = triggers.send(SagaTrigger::start(saga_id)).await {
                    tracing::error!(%saga_id, error = %err, "failed to queue demo saga");
                }
            }
            Err(err) => tracing::error!(order_id = %order.order_id, error = %err, "failed to create demo saga"),
        }
    }

    // 7. Run until signalled
    shutdown_signal().await;
    worker.shutdown().await;

    tracing::info!("saga worker shut down gracefully");
}
