//! Shared test harness.
//!
//! Tests run the full stack against an in-memory SQLite database with the
//! real migrations applied, a manually advanced clock, and zero-variance
//! seeded venues so scenario outcomes are pinned.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use migration::MigratorTrait;
use rust_decimal_macros::dec;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use swapflow_backend::config::Config;
use swapflow_backend::jobs::order_worker::{self, WorkerContext};
use swapflow_backend::services::clock::ManualClock;
use swapflow_backend::services::venue::{MockVenue, Venue};
use swapflow_backend::{app_router, build_state_with_clock, AppState};

/// Set up an isolated in-memory test database with migrations applied.
pub async fn setup_test_db() -> DatabaseConnection {
    let mut options = ConnectOptions::new("sqlite::memory:".to_string());
    options.max_connections(1).min_connections(1);
    let db = Database::connect(options)
        .await
        .expect("Failed to connect to test DB");
    migration::Migrator::up(&db, None)
        .await
        .expect("Failed to run migrations");
    db
}

pub struct TestHarness {
    pub db: DatabaseConnection,
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    pub alpha: Arc<MockVenue>,
    pub beta: Arc<MockVenue>,
    pub worker: Arc<WorkerContext>,
}

impl TestHarness {
    pub fn app(&self) -> axum::Router {
        app_router(self.state.clone())
    }

    /// Lease and process at most one due job; false when nothing was due.
    pub async fn drive_one_job(&self) -> bool {
        match self
            .worker
            .queue
            .lease("test-worker")
            .await
            .expect("lease failed")
        {
            Some(job) => {
                order_worker::process_job(&self.worker, job).await;
                true
            }
            None => false,
        }
    }
}

pub async fn harness() -> TestHarness {
    harness_with(Config::default()).await
}

pub async fn harness_with(config: Config) -> TestHarness {
    let db = setup_test_db().await;
    let clock = Arc::new(ManualClock::new(Utc::now()));

    // S1 pricing: alpha nets 99.7, beta nets 100.299
    let alpha = Arc::new(
        MockVenue::new("alpha", dec!(100), dec!(0.003), Some(11)).with_variance_bps(0),
    );
    let beta = Arc::new(
        MockVenue::new("beta", dec!(100.5), dec!(0.002), Some(12)).with_variance_bps(0),
    );
    let venues: Vec<Arc<dyn Venue>> = vec![alpha.clone(), beta.clone()];

    let state = build_state_with_clock(db.clone(), config, venues, clock.clone());
    let worker = Arc::new(WorkerContext {
        repo: state.repo.clone(),
        queue: state.queue.clone(),
        bus: state.bus.clone(),
        router: state.router.clone(),
        clock: clock.clone(),
    });

    TestHarness {
        db,
        state,
        clock,
        alpha,
        beta,
        worker,
    }
}

pub fn order_body(amount: &str, slippage: &str) -> Value {
    serde_json::json!({
        "type": "market",
        "tokenIn": "SOL",
        "tokenOut": "USDC",
        "amount": amount,
        "slippage": slippage,
    })
}

/// POST /orders/execute with an injected client address.
pub async fn post_order(
    app: &axum::Router,
    body: &Value,
    idempotency_key: Option<&str>,
    client_ip: &str,
) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/orders/execute")
        .header("content-type", "application/json");
    if let Some(key) = idempotency_key {
        builder = builder.header("Idempotency-Key", key);
    }

    let mut request = builder.body(Body::from(body.to_string())).unwrap();
    let addr: SocketAddr = format!("{}:40000", client_ip).parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    (status, headers, json)
}

pub async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

pub fn order_id_of(json: &Value) -> Uuid {
    json["orderId"].as_str().unwrap().parse().unwrap()
}
