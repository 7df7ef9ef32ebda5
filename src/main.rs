use migration::MigratorTrait;
use rust_decimal::Decimal;
use sea_orm::Database;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use swapflow_backend::jobs::{order_worker, reclaimer};
use swapflow_backend::services::venue::{MockVenue, Venue};
use swapflow_backend::{app_router, build_state, config::Config};

#[tokio::main]
async fn main() {
    // Initialize tracing
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{},swapflow_backend=debug,sqlx=warn", log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    // Connect to database
    tracing::info!("Connecting to database...");
    let db = Database::connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    tracing::info!("Running migrations...");
    migration::Migrator::up(&db, None)
        .await
        .expect("Failed to run migrations");

    // Simulated execution venues. With MOCK_SEED set, quoting and fills are
    // deterministic across runs.
    let venues: Vec<Arc<dyn Venue>> = vec![
        Arc::new(MockVenue::new(
            "alpha-swap",
            Decimal::new(100, 0),
            Decimal::new(3, 3),
            config.mock_seed,
        )),
        Arc::new(MockVenue::new(
            "beta-dex",
            Decimal::new(1005, 1),
            Decimal::new(2, 3),
            config.mock_seed.map(|s| s.wrapping_add(1)),
        )),
        Arc::new(MockVenue::new(
            "gamma-amm",
            Decimal::new(998, 1),
            Decimal::new(25, 4),
            config.mock_seed.map(|s| s.wrapping_add(2)),
        )),
    ];

    let state = build_state(db, config.clone(), venues);

    // Start the worker pool driving the order lifecycle
    let worker_ctx = Arc::new(order_worker::WorkerContext {
        repo: state.repo.clone(),
        queue: state.queue.clone(),
        bus: state.bus.clone(),
        router: state.router.clone(),
        clock: state.clock.clone(),
    });
    let worker_id = format!("worker-{}", Uuid::new_v4().simple());
    order_worker::start_order_worker_job(worker_ctx, worker_id, config.queue_concurrency).await;

    // Janitor: expired lease recovery and stale pending re-enqueue
    reclaimer::start_reclaimer_job(state.repo.clone(), state.queue.clone(), state.clock.clone())
        .await;

    let app = app_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .expect("Failed to bind listener");

    tracing::info!("Server listening on {}", listener.local_addr().unwrap());

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Server error");

    tracing::info!("Server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining...");
}
