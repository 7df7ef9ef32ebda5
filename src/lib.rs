// src/lib.rs

use axum::routing::{get, post};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

pub mod config;
pub mod error;

pub mod entities {
    pub mod prelude;
    pub mod jobs;
    pub mod orders;
}

pub mod services {
    pub mod bus;
    pub mod clock;
    pub mod idempotency;
    pub mod queue;
    pub mod rate_limit;
    pub mod repository;
    pub mod router;
    pub mod submission;
    pub mod venue;
}

pub mod handlers;
pub mod jobs;
pub mod models;

use config::Config;
use handlers::orders_ws::StreamConnectionRegistry;
use services::bus::OrderEventBus;
use services::clock::{Clock, SystemClock};
use services::idempotency::IdempotencyStore;
use services::queue::DurableQueue;
use services::rate_limit::SlidingWindowRateLimiter;
use services::repository::OrderRepository;
use services::router::Router as VenueRouter;
use services::submission::SubmissionService;
use services::venue::Venue;

/// Length of the sliding rate-limit window
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub config: Config,
    pub repo: Arc<OrderRepository>,
    pub queue: Arc<DurableQueue>,
    pub bus: Arc<OrderEventBus>,
    pub router: Arc<VenueRouter>,
    pub submission: Arc<SubmissionService>,
    pub clock: Arc<dyn Clock>,
    pub stream_connections: Arc<StreamConnectionRegistry>,
}

/// Wire the shared services for the given database and venue set.
pub fn build_state(
    db: DatabaseConnection,
    config: Config,
    venues: Vec<Arc<dyn Venue>>,
) -> AppState {
    build_state_with_clock(db, config, venues, Arc::new(SystemClock))
}

pub fn build_state_with_clock(
    db: DatabaseConnection,
    config: Config,
    venues: Vec<Arc<dyn Venue>>,
    clock: Arc<dyn Clock>,
) -> AppState {
    let repo = Arc::new(OrderRepository::new(db.clone(), clock.clone()));
    let queue = Arc::new(DurableQueue::new(
        db.clone(),
        clock.clone(),
        config.max_retries,
    ));
    let bus = Arc::new(OrderEventBus::new());
    let router = Arc::new(VenueRouter::new(venues));
    let rate_limiter = Arc::new(SlidingWindowRateLimiter::new(
        config.rate_limit,
        RATE_LIMIT_WINDOW,
        clock.clone(),
    ));
    let idempotency = Arc::new(IdempotencyStore::default());
    let submission = Arc::new(SubmissionService::new(
        repo.clone(),
        queue.clone(),
        rate_limiter,
        idempotency,
    ));

    AppState {
        db,
        config,
        repo,
        queue,
        bus,
        router,
        submission,
        clock,
        stream_connections: Arc::new(StreamConnectionRegistry::new()),
    }
}

/// Build the HTTP router. The stream endpoint shares the submission path:
/// POST submits, GET upgrades to the status WebSocket.
pub fn app_router(state: AppState) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    axum::Router::new()
        .route("/health", get(handlers::health::health))
        .route(
            "/orders/execute",
            post(handlers::execute::execute_order).get(handlers::orders_ws::order_stream),
        )
        .route("/orders/{id}", get(handlers::orders::get_order))
        .layer(cors)
        .with_state(state)
}
