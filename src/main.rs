use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use clap::Parser;
use futures::FutureExt;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paysettle::config::Config;
use paysettle::db::{AppState, create_pool, init_db};
use paysettle::dedupe::{DedupeStore, SqliteDedupeStore};
use paysettle::gateway::PayPalGateway;
use paysettle::handlers;
use paysettle::payments;

#[derive(Parser, Debug)]
#[command(name = "paysettle")]
#[command(about = "Payment capture and reconciliation engine")]
struct Cli {
    /// Run one reconciliation pass (attempts and refunds) and exit
    #[arg(long)]
    scan_once: bool,

    /// Override the reconciliation batch size for this run
    #[arg(long)]
    batch_size: Option<usize>,
}

async fn run_reconcile_pass(state: &AppState, batch_size: usize) {
    match payments::scan(state, batch_size).await {
        Ok(count) if count > 0 => tracing::info!("Reconciled {} payment attempts", count),
        Ok(_) => {}
        Err(e) => tracing::warn!("Reconciliation pass failed: {}", e),
    }
    match payments::scan_refunds(state, batch_size).await {
        Ok(count) if count > 0 => tracing::info!("Settled {} refunds", count),
        Ok(_) => {}
        Err(e) => tracing::warn!("Refund pass failed: {}", e),
    }
}

/// Spawns the periodic reconciliation pass. A panicking pass is logged and
/// the loop keeps running.
fn spawn_reconcile_task(state: AppState, interval: Duration, batch_size: usize) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let result = AssertUnwindSafe(run_reconcile_pass(&state, batch_size))
                .catch_unwind()
                .await;
            if let Err(panic) = result {
                let panic_msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("Reconciliation pass panicked: {}", panic_msg);
            }
        }
    });

    tracing::info!(
        "Reconciliation task started (every {}s, batch {})",
        interval.as_secs(),
        batch_size
    );
}

/// Spawns a background task that purges expired webhook dedupe markers.
/// Runs every 5 minutes.
fn spawn_cleanup_task(store: Arc<dyn DedupeStore>) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(5 * 60);

        loop {
            tokio::time::sleep(interval).await;

            match store.purge_expired() {
                Ok(count) if count > 0 => {
                    tracing::debug!("Purged {} expired webhook markers", count);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Failed to purge webhook markers: {}", e);
                }
            }
        }
    });

    tracing::info!("Background cleanup task started (runs every 5 minutes)");
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "paysettle=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    let db_pool = create_pool(&config.database_path).expect("Failed to create database pool");
    {
        let conn = db_pool.get().expect("Failed to get connection");
        init_db(&conn).expect("Failed to initialize database");
    }

    let gateway = PayPalGateway::new(&config.gateway).expect("Failed to create gateway client");
    let dedupe: Arc<dyn DedupeStore> = Arc::new(SqliteDedupeStore::new(db_pool.clone()));

    let state = AppState {
        db: db_pool,
        gateway: Arc::new(gateway),
        dedupe: dedupe.clone(),
        settings: config.payments.clone(),
    };

    let batch_size = cli
        .batch_size
        .map(paysettle::config::clamp_batch)
        .unwrap_or(config.payments.reconcile_batch_size);

    if cli.scan_once {
        run_reconcile_pass(&state, batch_size).await;
        return;
    }

    spawn_reconcile_task(state.clone(), config.reconcile_interval, batch_size);
    spawn_cleanup_task(dedupe);

    let app = Router::new()
        .merge(handlers::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Paysettle listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start server");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received, stopping server...");
}
