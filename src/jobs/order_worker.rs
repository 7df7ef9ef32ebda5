//! Order execution worker.
//!
//! Leases jobs from the durable queue and drives the order lifecycle state
//! machine:
//!
//!   pending → routing → building → submitted → confirmed
//!                                            ↘ failed
//!
//! Every stage starts by reading the persisted status and resumes from the
//! next unfinished stage, which makes duplicate delivery after a crash
//! harmless. Each persisted change is followed by a publish on the order's
//! bus topic; publish failures never roll back the database write.
//! Supports graceful shutdown via SIGTERM/SIGINT signals.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::interval;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::{jobs, orders};
use crate::error::ExecutionError;
use crate::models::order::{
    ExecuteOrderRequest, LogEntry, OrderEvent, OrderStatus, ValidatedOrder,
};
use crate::services::bus::OrderEventBus;
use crate::services::clock::Clock;
use crate::services::queue::{DurableQueue, NackOutcome};
use crate::services::repository::{OrderRepository, TransitionOutcome, TransitionPatch};
use crate::services::router::Router;

/// Hard wall-clock budget for one delivery of a job
pub const JOB_DEADLINE: Duration = Duration::from_secs(30);

/// Queue poll cadence while idle
const POLL_INTERVAL_MS: u64 = 250;

/// Shared dependencies of the worker loop
pub struct WorkerContext {
    pub repo: Arc<OrderRepository>,
    pub queue: Arc<DurableQueue>,
    pub bus: Arc<OrderEventBus>,
    pub router: Arc<Router>,
    pub clock: Arc<dyn Clock>,
}

/// Start the order worker loop.
///
/// Keeps up to `concurrency` jobs in flight; on shutdown, stops leasing and
/// waits for in-flight jobs to reach their next persisted boundary.
pub async fn start_order_worker_job(ctx: Arc<WorkerContext>, worker_id: String, concurrency: usize) {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut poll = interval(Duration::from_millis(POLL_INTERVAL_MS));

        info!(worker_id = %worker_id, concurrency, "Order worker started");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, stopping order worker gracefully");
                    break;
                }
                _ = poll.tick() => {
                    drain_due_jobs(&ctx, &worker_id, &semaphore).await;
                }
            }
        }

        // Wait for in-flight jobs before returning
        let _ = semaphore.acquire_many(concurrency as u32).await;
        info!(worker_id = %worker_id, "Order worker drained");
    });
}

async fn drain_due_jobs(ctx: &Arc<WorkerContext>, worker_id: &str, semaphore: &Arc<Semaphore>) {
    loop {
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return,
        };

        match ctx.queue.lease(worker_id).await {
            Ok(Some(job)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    process_job(&ctx, job).await;
                    drop(permit);
                });
            }
            Ok(None) => return,
            Err(err) => {
                error!(error = %err, "Job lease failed");
                return;
            }
        }
    }
}

/// Run one delivery of a job to its conclusion: ack, retry or dead-letter.
pub async fn process_job(ctx: &WorkerContext, job: jobs::Model) {
    let order_id = job.order_id;
    let started = Instant::now();

    let result = tokio::time::timeout(JOB_DEADLINE, run_lifecycle(ctx, &job)).await;

    match result {
        Ok(Ok(())) => {
            if let Err(err) = ctx.queue.ack(job.id).await {
                error!(job_id = job.id, error = %err, "Failed to ack completed job");
            }
        }
        Ok(Err(err)) if err.is_retriable() => {
            handle_retriable(ctx, &job, &err).await;
        }
        Ok(Err(ExecutionError::CorruptState(reason))) => {
            // Leave the order in its prior state; operator-visible only
            error!(order_id = %order_id, reason = %reason, "Corrupted order state");
            if let Err(err) = ctx.queue.fail_terminal(job.id, &reason).await {
                error!(job_id = job.id, error = %err, "Failed to dead-letter job");
            }
        }
        Ok(Err(err)) => {
            // Non-retriable: slippage violation or validation failure
            if let Err(queue_err) = ctx.queue.fail_terminal(job.id, &err.to_string()).await {
                error!(job_id = job.id, error = %queue_err, "Failed to dead-letter job");
            }
            mark_failed(ctx, order_id, &err.to_string(), None).await;
        }
        Err(_) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            warn!(order_id = %order_id, elapsed_ms, "Job exceeded its deadline");
            if let Err(err) = ctx.queue.fail_terminal(job.id, "timeout").await {
                error!(job_id = job.id, error = %err, "Failed to dead-letter job");
            }
            mark_failed(ctx, order_id, "timeout", None).await;
        }
    }
}

async fn handle_retriable(ctx: &WorkerContext, job: &jobs::Model, err: &ExecutionError) {
    match ctx.queue.nack(job, &err.to_string()).await {
        Ok(NackOutcome::RetryScheduled {
            attempt,
            max_attempts,
            next_run_at,
        }) => {
            let now = ctx.clock.now();
            let entry = LogEntry::new("retry_scheduled", now)
                .with("attempt", attempt)
                .with("maxAttempts", max_attempts)
                .with("nextRunAt", next_run_at.to_rfc3339())
                .with("error", err.to_string());
            if let Err(log_err) = ctx.repo.append_log(job.order_id, entry).await {
                error!(order_id = %job.order_id, error = %log_err, "Failed to record retry log entry");
            }
            ctx.bus.publish(OrderEvent::retry_scheduled(
                job.order_id,
                attempt,
                max_attempts,
                next_run_at,
                now,
            ));
        }
        Ok(NackOutcome::FailedTerminal) => {
            mark_failed(
                ctx,
                job.order_id,
                &err.to_string(),
                Some(job.attempt as u32),
            )
            .await;
        }
        Err(queue_err) => {
            error!(job_id = job.id, error = %queue_err, "Failed to nack job");
        }
    }
}

/// Advance the order from its current persisted status to a terminal one.
async fn run_lifecycle(ctx: &WorkerContext, job: &jobs::Model) -> Result<(), ExecutionError> {
    let request: ExecuteOrderRequest = serde_json::from_value(job.payload.clone())
        .map_err(|e| ExecutionError::Validation(format!("corrupt job payload: {}", e)))?;
    let order = ValidatedOrder::try_from_request(&request)
        .map_err(|_| ExecutionError::Validation("job payload failed validation".to_string()))?;
    let order_id = job.order_id;

    loop {
        let row = ctx
            .repo
            .find(order_id)
            .await?
            .ok_or_else(|| ExecutionError::Validation(format!("order {} has no row", order_id)))?;
        let status = OrderRepository::status_of(&row)
            .map_err(|e| ExecutionError::CorruptState(e.to_string()))?;

        match status {
            OrderStatus::Pending => {
                let now = ctx.clock.now();
                let entry = LogEntry::new("routing", now).with("message", "fetching quotes");
                apply_transition(
                    ctx,
                    order_id,
                    OrderStatus::Pending,
                    OrderStatus::Routing,
                    TransitionPatch::default(),
                    entry,
                )
                .await?;
            }
            OrderStatus::Routing => {
                let quotes = ctx
                    .router
                    .quotes(&order.token_in, &order.token_out, order.amount_in)
                    .await?;
                let (venue_id, best) = Router::select_best(&quotes)?;

                let quote_map: BTreeMap<String, String> = quotes
                    .iter()
                    .map(|(id, q)| (id.clone(), q.net_price().normalize().to_string()))
                    .collect();

                let now = ctx.clock.now();
                let entry = LogEntry::new("building", now)
                    .with("dexUsed", venue_id.clone())
                    .with("expectedPrice", best.price.normalize().to_string())
                    .with("quotes", serde_json::to_value(&quote_map).unwrap_or_default());
                let patch = TransitionPatch {
                    dex_used: Some(venue_id),
                    expected_price: Some(best.price.normalize().to_string()),
                    quotes: Some(quote_map),
                    ..Default::default()
                };
                apply_transition(
                    ctx,
                    order_id,
                    OrderStatus::Routing,
                    OrderStatus::Building,
                    patch,
                    entry,
                )
                .await?;
            }
            OrderStatus::Building => {
                let venue_id = row.dex_used.clone().ok_or_else(|| {
                    ExecutionError::CorruptState("building stage without a selected venue".into())
                })?;
                let expected = parse_price(&row.expected_price, "expected price")?;

                let execution = ctx
                    .router
                    .execute(
                        &venue_id,
                        &order.token_in,
                        &order.token_out,
                        order.amount_in,
                        expected,
                        order.slippage,
                    )
                    .await?;

                let now = ctx.clock.now();
                let entry = LogEntry::new("submitted", now)
                    .with("txHash", execution.tx_hash.clone())
                    .with(
                        "executedPrice",
                        execution.executed_price.normalize().to_string(),
                    );
                let patch = TransitionPatch {
                    tx_hash: Some(execution.tx_hash),
                    executed_price: Some(execution.executed_price.normalize().to_string()),
                    ..Default::default()
                };
                apply_transition(
                    ctx,
                    order_id,
                    OrderStatus::Building,
                    OrderStatus::Submitted,
                    patch,
                    entry,
                )
                .await?;
            }
            OrderStatus::Submitted => {
                let expected = parse_price(&row.expected_price, "expected price")?;
                let actual = parse_price(&row.executed_price, "executed price")?;

                if !Router::check_slippage(expected, actual, order.slippage) {
                    let deviation = if expected.is_zero() {
                        Decimal::ONE
                    } else {
                        ((expected - actual).abs() / expected).normalize()
                    };
                    return Err(ExecutionError::SlippageExceeded {
                        limit: order.slippage,
                        actual: deviation,
                    });
                }

                let amount_out = (order.amount_in * actual).normalize();
                let now = ctx.clock.now();
                let entry = LogEntry::new("confirmed", now)
                    .with("amountOut", amount_out.to_string())
                    .with("executedPrice", actual.normalize().to_string());
                let patch = TransitionPatch {
                    amount_out: Some(amount_out.to_string()),
                    ..Default::default()
                };
                apply_transition(
                    ctx,
                    order_id,
                    OrderStatus::Submitted,
                    OrderStatus::Confirmed,
                    patch,
                    entry,
                )
                .await?;
                return Ok(());
            }
            OrderStatus::Confirmed | OrderStatus::Failed => {
                // Duplicate delivery of an already-settled order
                return Ok(());
            }
        }
    }
}

/// Apply one transition and publish it. A lost race means another delivery
/// advanced the order; the caller's loop re-reads and resumes.
async fn apply_transition(
    ctx: &WorkerContext,
    order_id: Uuid,
    from: OrderStatus,
    to: OrderStatus,
    patch: TransitionPatch,
    entry: LogEntry,
) -> Result<(), ExecutionError> {
    match ctx.repo.transition(order_id, from, to, patch, entry).await? {
        TransitionOutcome::Applied(row) => {
            ctx.bus.publish(event_for(&row));
            Ok(())
        }
        TransitionOutcome::Conflict(row) => {
            warn!(
                order_id = %order_id,
                status = %row.status,
                "Skipping already-applied transition"
            );
            Ok(())
        }
    }
}

/// Persist terminal failure from whatever non-terminal state the order is
/// in, then publish.
async fn mark_failed(ctx: &WorkerContext, order_id: Uuid, reason: &str, attempt: Option<u32>) {
    let row = match ctx.repo.find(order_id).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            error!(order_id = %order_id, "Cannot fail an order with no row");
            return;
        }
        Err(err) => {
            error!(order_id = %order_id, error = %err, "Failed to load order for failure");
            return;
        }
    };

    let status = match OrderRepository::status_of(&row) {
        Ok(status) => status,
        Err(err) => {
            error!(order_id = %order_id, error = %err, "Unparseable status on failure path");
            return;
        }
    };
    if status.is_terminal() {
        return;
    }

    let now = ctx.clock.now();
    let mut entry = LogEntry::new("failed", now).with("reason", reason);
    if let Some(attempt) = attempt {
        entry = entry.with("attempt", attempt);
    }
    let patch = TransitionPatch {
        failure_reason: Some(reason.to_string()),
        ..Default::default()
    };

    match ctx
        .repo
        .transition(order_id, status, OrderStatus::Failed, patch, entry)
        .await
    {
        Ok(TransitionOutcome::Applied(row)) => {
            ctx.bus.publish(event_for(&row));
        }
        Ok(TransitionOutcome::Conflict(row)) => {
            warn!(order_id = %order_id, status = %row.status, "Order settled before failure write");
        }
        Err(err) => {
            error!(order_id = %order_id, error = %err, "Failed to persist terminal failure");
        }
    }
}

/// Build the bus event mirroring a freshly persisted row.
fn event_for(row: &orders::Model) -> OrderEvent {
    let status = row
        .status
        .parse::<OrderStatus>()
        .unwrap_or(OrderStatus::Failed);
    let timestamp = row.updated_at.with_timezone(&chrono::Utc);
    let mut event = OrderEvent::transition(row.id, status, timestamp);
    match status {
        OrderStatus::Building => {
            event.dex_used = row.dex_used.clone();
            event.quotes = serde_json::from_value(row.quotes.clone()).ok();
        }
        OrderStatus::Submitted => {
            event.dex_used = row.dex_used.clone();
            event.tx_hash = row.tx_hash.clone();
        }
        OrderStatus::Confirmed => {
            event.dex_used = row.dex_used.clone();
            event.tx_hash = row.tx_hash.clone();
            event.amount_out = row.amount_out.clone();
            event.executed_price = row.executed_price.clone();
        }
        OrderStatus::Failed => {
            event.failure_reason = row.failure_reason.clone();
        }
        OrderStatus::Pending | OrderStatus::Routing => {}
    }
    event
}

fn parse_price(value: &Option<String>, what: &str) -> Result<Decimal, ExecutionError> {
    value
        .as_deref()
        .ok_or_else(|| ExecutionError::CorruptState(format!("missing {}", what)))?
        .parse::<Decimal>()
        .map_err(|_| ExecutionError::CorruptState(format!("unparseable {}", what)))
}
