//! DispatchRelay Webhook Worker
//!
//! Polls the durable outbox, leases batches, and delivers events to
//! registered webhook subscriptions with signed POSTs. Any number of worker
//! processes may run against the same store.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RELAY_OUTBOX_DB_TYPE` | `postgres` | Database type: `sqlite`, `postgres` |
//! | `RELAY_OUTBOX_DB_URL` | - | Database connection URL (required) |
//! | `RELAY_POLL_INTERVAL_MS` | `500` | Outbox poll interval in milliseconds |
//! | `RELAY_BATCH_LIMIT` | `100` | Max events claimed per poll |
//! | `RELAY_LEASE_SECONDS` | `30` | Row lease duration |
//! | `RELAY_MAX_ATTEMPTS` | `8` | Attempt ceiling before dead-lettering |
//! | `RELAY_MAX_IN_FLIGHT_DEFAULT` | `4` | Per-subscription concurrency cap fallback |
//! | `RELAY_METRICS_PORT` | `9090` | Metrics/health port |
//! | `RELAY_METRICS_INTERVAL_MS` | `5000` | Metrics reporting interval |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_outbox::{
    spawn_metrics_reporter, DeliveryWorker, DeliveryWorkerConfig, OutboxStore, SubscriptionStore,
    WebhookDispatcher, WebhookDispatcherConfig,
};

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable is required", key))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting DispatchRelay Webhook Worker");

    let db_type = env_or("RELAY_OUTBOX_DB_TYPE", "postgres");
    let poll_interval_ms: u64 = env_or_parse("RELAY_POLL_INTERVAL_MS", 500);
    let batch_limit: u32 = env_or_parse("RELAY_BATCH_LIMIT", 100);
    let lease_seconds: u64 = env_or_parse("RELAY_LEASE_SECONDS", 30);
    let max_attempts: i32 = env_or_parse("RELAY_MAX_ATTEMPTS", 8);
    let default_max_in_flight: u32 = env_or_parse("RELAY_MAX_IN_FLIGHT_DEFAULT", 4);
    let metrics_port: u16 = env_or_parse("RELAY_METRICS_PORT", 9090);
    let metrics_interval_ms: u64 = env_or_parse("RELAY_METRICS_INTERVAL_MS", 5000);

    let recorder_handle = PrometheusBuilder::new().install_recorder()?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let (outbox, subscriptions) = create_stores(&db_type).await?;
    info!("Outbox store initialized ({})", db_type);

    let dispatcher = WebhookDispatcher::new(WebhookDispatcherConfig::default())?;
    let worker = Arc::new(DeliveryWorker::new(
        outbox.clone(),
        subscriptions,
        dispatcher,
        DeliveryWorkerConfig {
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_limit,
            lease: Duration::from_secs(lease_seconds),
            max_attempts,
            default_max_in_flight,
        },
    ));

    let worker_handle = {
        let worker = worker.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = worker.start() => {}
                _ = shutdown_rx.recv() => {
                    info!("Delivery worker shutting down");
                }
            }
        })
    };

    let reporter_handle = spawn_metrics_reporter(
        outbox,
        worker.metrics(),
        Duration::from_millis(metrics_interval_ms),
        shutdown_tx.subscribe(),
    );

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    info!("Metrics server listening on http://{}/metrics", metrics_addr);

    let metrics_app = axum::Router::new()
        .route(
            "/metrics",
            get(move || {
                let handle = recorder_handle.clone();
                async move { handle.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler));

    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    let metrics_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(metrics_listener, metrics_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("DispatchRelay Webhook Worker started");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = worker_handle.await;
        let _ = reporter_handle.await;
        let _ = metrics_handle.await;
    })
    .await;

    info!("DispatchRelay Webhook Worker shutdown complete");
    Ok(())
}

async fn create_stores(
    db_type: &str,
) -> Result<(Arc<dyn OutboxStore>, Arc<dyn SubscriptionStore>)> {
    match db_type {
        "sqlite" => {
            let url = env_required("RELAY_OUTBOX_DB_URL")?;
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await?;
            let store = Arc::new(relay_outbox::sqlite::SqliteOutboxStore::new(pool));
            store.init_schema().await?;
            info!("Using SQLite outbox: {}", url);
            let outbox: Arc<dyn OutboxStore> = store.clone();
            let subscriptions: Arc<dyn SubscriptionStore> = store;
            Ok((outbox, subscriptions))
        }
        "postgres" => {
            let url = env_required("RELAY_OUTBOX_DB_URL")?;
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await?;
            let store = Arc::new(relay_outbox::postgres::PostgresOutboxStore::new(pool));
            store.init_schema().await?;
            info!("Using PostgreSQL outbox");
            let outbox: Arc<dyn OutboxStore> = store.clone();
            let subscriptions: Arc<dyn SubscriptionStore> = store;
            Ok((outbox, subscriptions))
        }
        other => Err(anyhow::anyhow!(
            "Unknown database type: {}. Use sqlite or postgres",
            other
        )),
    }
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "READY"
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
