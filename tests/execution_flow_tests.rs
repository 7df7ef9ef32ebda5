//! End-to-end lifecycle tests: routing, settlement, retries with backoff,
//! dead-lettering, duplicate delivery and janitor recovery.

mod common;

use chrono::Duration as ChronoDuration;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

use swapflow_backend::entities::{jobs, orders};
use swapflow_backend::jobs::reclaimer;
use swapflow_backend::models::order::{LogEntry, OrderStatus, ValidatedOrder};
use swapflow_backend::services::clock::Clock;
use swapflow_backend::services::repository::TransitionPatch;

use crate::common::{harness, order_body, order_id_of, post_order, TestHarness};

async fn submit_order(harness: &TestHarness, amount: &str, slippage: &str) -> Uuid {
    let app = harness.app();
    let (status, _, json) = post_order(&app, &order_body(amount, slippage), None, "10.9.0.1").await;
    assert_eq!(status, axum::http::StatusCode::OK);
    order_id_of(&json)
}

async fn load_order(harness: &TestHarness, id: Uuid) -> orders::Model {
    orders::Entity::find_by_id(id)
        .one(&harness.db)
        .await
        .unwrap()
        .expect("order row missing")
}

async fn load_job(harness: &TestHarness, order_id: Uuid) -> jobs::Model {
    jobs::Entity::find()
        .filter(jobs::Column::OrderId.eq(order_id))
        .one(&harness.db)
        .await
        .unwrap()
        .expect("job row missing")
}

fn log_stages(row: &orders::Model) -> Vec<String> {
    row.logs
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["stage"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn happy_path_settles_on_the_best_venue() {
    let harness = harness().await;
    harness.beta.set_executed_price(dec!(100.2));

    let order_id = submit_order(&harness, "1.0", "0.05").await;
    let mut subscription = harness.state.bus.subscribe(order_id);

    assert!(harness.drive_one_job().await);

    let row = load_order(&harness, order_id).await;
    assert_eq!(row.status, "confirmed");
    assert_eq!(row.dex_used.as_deref(), Some("beta"));
    assert_eq!(row.amount_out.as_deref(), Some("100.2"));
    assert_eq!(row.expected_price.as_deref(), Some("100.5"));
    assert_eq!(row.executed_price.as_deref(), Some("100.2"));
    assert!(row.tx_hash.as_deref().unwrap().starts_with("0x"));
    assert!(row.failure_reason.is_none());

    // Quotes persisted net of fee for both venues
    assert_eq!(row.quotes["alpha"], "99.7");
    assert_eq!(row.quotes["beta"], "100.299");

    assert_eq!(
        log_stages(&row),
        vec!["pending", "routing", "building", "submitted", "confirmed"]
    );

    // Live subscriber saw every transition, in order
    let mut seen = Vec::new();
    while let Ok(event) = subscription.receiver.try_recv() {
        seen.push(event.status);
    }
    assert_eq!(seen, vec!["routing", "building", "submitted", "confirmed"]);

    let job = load_job(&harness, order_id).await;
    assert_eq!(job.state, "succeeded");
    assert_eq!(job.attempt, 0);
}

#[tokio::test]
async fn slippage_violation_fails_without_retry() {
    let harness = harness().await;
    harness.beta.set_executed_price(dec!(95));

    let order_id = submit_order(&harness, "1.0", "0.001").await;
    assert!(harness.drive_one_job().await);

    let row = load_order(&harness, order_id).await;
    assert_eq!(row.status, "failed");
    let reason = row.failure_reason.as_deref().unwrap();
    assert!(reason.contains("slippage"), "reason was: {}", reason);
    // Terminal failed rows carry no tx hash; the submitted log entry does
    assert!(row.tx_hash.is_none());
    assert!(row.amount_out.is_none());

    let stages = log_stages(&row);
    assert_eq!(
        stages,
        vec!["pending", "routing", "building", "submitted", "failed"]
    );
    let logs = row.logs.as_array().unwrap();
    assert!(logs[3]["txHash"].as_str().unwrap().starts_with("0x"));

    let job = load_job(&harness, order_id).await;
    assert_eq!(job.state, "failed_terminal");
    assert_eq!(job.attempt, 0, "no retries may be scheduled");
}

#[tokio::test]
async fn transient_failures_back_off_then_settle() {
    let harness = harness().await;
    harness.alpha.fail_next_quotes(2);
    harness.beta.fail_next_quotes(2);
    harness.beta.set_executed_price(dec!(100.4));

    let order_id = submit_order(&harness, "1.0", "0.05").await;
    let mut subscription = harness.state.bus.subscribe(order_id);

    // Attempt 1 fails, retry scheduled 2s out
    assert!(harness.drive_one_job().await);
    let job = load_job(&harness, order_id).await;
    assert_eq!(job.state, "retry_scheduled");
    assert_eq!(job.attempt, 1);
    let delay = job.next_run_at.with_timezone(&chrono::Utc) - harness.clock.now();
    assert_eq!(delay.num_seconds(), 2);

    // Not due yet
    assert!(!harness.drive_one_job().await);

    // Attempt 2 fails, retry scheduled 4s out
    harness.clock.advance(ChronoDuration::seconds(2));
    assert!(harness.drive_one_job().await);
    let job = load_job(&harness, order_id).await;
    assert_eq!(job.attempt, 2);
    let delay = job.next_run_at.with_timezone(&chrono::Utc) - harness.clock.now();
    assert_eq!(delay.num_seconds(), 4);

    // Attempt 3 succeeds
    harness.clock.advance(ChronoDuration::seconds(4));
    assert!(harness.drive_one_job().await);

    let row = load_order(&harness, order_id).await;
    assert_eq!(row.status, "confirmed");

    let stages = log_stages(&row);
    assert_eq!(
        stages,
        vec![
            "pending",
            "routing",
            "retry_scheduled",
            "retry_scheduled",
            "building",
            "submitted",
            "confirmed"
        ]
    );

    let mut retry_events = Vec::new();
    while let Ok(event) = subscription.receiver.try_recv() {
        if event.status == "retry_scheduled" {
            retry_events.push((event.attempt.unwrap(), event.max_attempts.unwrap()));
        }
    }
    assert_eq!(retry_events, vec![(1, 3), (2, 3)]);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_the_order() {
    let harness = harness().await;
    harness.alpha.fail_next_quotes(100);
    harness.beta.fail_next_quotes(100);

    let order_id = submit_order(&harness, "1.0", "0.05").await;

    // Initial delivery plus three retries at 2s, 4s, 8s
    assert!(harness.drive_one_job().await);
    for backoff in [2i64, 4, 8] {
        let job = load_job(&harness, order_id).await;
        assert_eq!(job.state, "retry_scheduled");
        let delay = job.next_run_at.with_timezone(&chrono::Utc) - harness.clock.now();
        assert_eq!(delay.num_seconds(), backoff);

        harness.clock.advance(ChronoDuration::seconds(backoff));
        assert!(harness.drive_one_job().await);
    }

    let row = load_order(&harness, order_id).await;
    assert_eq!(row.status, "failed");
    let reason = row.failure_reason.as_deref().unwrap();
    assert!(reason.contains("quote"), "reason was: {}", reason);

    let stages = log_stages(&row);
    let retries = stages.iter().filter(|s| *s == "retry_scheduled").count();
    assert_eq!(retries, 3);
    assert_eq!(stages.last().unwrap(), "failed");

    let job = load_job(&harness, order_id).await;
    assert_eq!(job.state, "failed_terminal");
    assert_eq!(job.attempt, 3);
}

#[tokio::test]
async fn duplicate_delivery_never_settles_twice() {
    let harness = harness().await;
    harness.beta.set_executed_price(dec!(100.2));

    let order_id = submit_order(&harness, "1.0", "0.05").await;
    assert!(harness.drive_one_job().await);
    assert_eq!(load_order(&harness, order_id).await.status, "confirmed");

    // A second delivery for a settled order (the terminal job freed the
    // order id, so re-enqueue creates a fresh envelope)
    let payload = serde_json::to_value(
        ValidatedOrder::try_from_request(&serde_json::from_value(order_body("1.0", "0.05")).unwrap())
            .unwrap()
            .to_request(),
    )
    .unwrap();
    harness
        .state
        .queue
        .enqueue(order_id, payload, "redelivery")
        .await
        .unwrap();
    assert!(harness.drive_one_job().await);

    let row = load_order(&harness, order_id).await;
    assert_eq!(row.status, "confirmed");
    let confirmed_entries = log_stages(&row)
        .iter()
        .filter(|s| *s == "confirmed")
        .count();
    assert_eq!(confirmed_entries, 1, "no duplicate confirmed transition");
}

#[tokio::test]
async fn worker_resumes_from_an_intermediate_stage() {
    let harness = harness().await;
    harness.beta.set_executed_price(dec!(100.3));

    let order_id = submit_order(&harness, "1.0", "0.05").await;

    // Simulate a worker that crashed right after persisting routing
    let entry = LogEntry::new("routing", harness.clock.now()).with("message", "fetching quotes");
    harness
        .state
        .repo
        .transition(
            order_id,
            OrderStatus::Pending,
            OrderStatus::Routing,
            TransitionPatch::default(),
            entry,
        )
        .await
        .unwrap();

    assert!(harness.drive_one_job().await);

    let row = load_order(&harness, order_id).await;
    assert_eq!(row.status, "confirmed");
    // The pending→routing stage was not repeated
    assert_eq!(
        log_stages(&row),
        vec!["pending", "routing", "building", "submitted", "confirmed"]
    );
}

#[tokio::test]
async fn expired_leases_return_to_waiting() {
    let harness = harness().await;
    let order_id = submit_order(&harness, "1.0", "0.05").await;

    // Lease without processing: the worker "crashed"
    let job = harness
        .state
        .queue
        .lease("crashed-worker")
        .await
        .unwrap()
        .expect("job should be due");
    assert_eq!(job.order_id, order_id);

    // Nothing is reclaimed before the visibility timeout
    assert_eq!(harness.state.queue.reclaim_expired().await.unwrap(), 0);

    harness.clock.advance(ChronoDuration::seconds(61));
    assert_eq!(harness.state.queue.reclaim_expired().await.unwrap(), 1);

    harness.beta.set_executed_price(dec!(100.2));
    assert!(harness.drive_one_job().await);
    assert_eq!(load_order(&harness, order_id).await.status, "confirmed");
}

#[tokio::test]
async fn enqueue_is_idempotent_while_a_job_is_live() {
    let harness = harness().await;
    let order_id = Uuid::new_v4();

    let first = harness
        .state
        .queue
        .enqueue(order_id, serde_json::json!({}), "c1")
        .await
        .unwrap();
    let second = harness
        .state
        .queue
        .enqueue(order_id, serde_json::json!({}), "c1")
        .await
        .unwrap();
    assert_eq!(first, second);

    let depth = harness.state.queue.depth().await.unwrap();
    assert_eq!(depth.waiting, 1);
}

#[tokio::test]
async fn janitor_reenqueues_stale_pending_orders() {
    let harness = harness().await;
    harness.beta.set_executed_price(dec!(100.2));

    // A row whose enqueue was lost
    let order_id = Uuid::new_v4();
    let validated = ValidatedOrder::try_from_request(
        &serde_json::from_value(order_body("1.0", "0.05")).unwrap(),
    )
    .unwrap();
    harness
        .state
        .repo
        .create_pending(order_id, &validated, "lost-enqueue")
        .await
        .unwrap();

    // Inside the grace period nothing happens
    let recovered = reclaimer::sweep_stale_pending(
        &harness.state.repo,
        &harness.state.queue,
        &harness.state.clock,
    )
    .await
    .unwrap();
    assert_eq!(recovered, 0);

    harness.clock.advance(ChronoDuration::seconds(61));
    let recovered = reclaimer::sweep_stale_pending(
        &harness.state.repo,
        &harness.state.queue,
        &harness.state.clock,
    )
    .await
    .unwrap();
    assert_eq!(recovered, 1);

    assert!(harness.drive_one_job().await);
    assert_eq!(load_order(&harness, order_id).await.status, "confirmed");
}
