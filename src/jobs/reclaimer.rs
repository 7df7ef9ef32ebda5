//! Janitor job: lease and enqueue recovery.
//!
//! Two sweeps on one interval: return `active` jobs whose lease outlived the
//! visibility timeout to `waiting`, and re-enqueue `pending` orders older
//! than the grace period whose enqueue was lost after row creation.
//! Supports graceful shutdown via SIGTERM/SIGINT signals.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

use crate::models::order::ExecuteOrderRequest;
use crate::services::clock::Clock;
use crate::services::queue::DurableQueue;
use crate::services::repository::OrderRepository;

/// Sweep cadence
const SWEEP_INTERVAL_SECS: u64 = 15;

/// How long a pending order may sit without a job before re-enqueue
pub const PENDING_GRACE_SECS: i64 = 60;

pub async fn start_reclaimer_job(
    repo: Arc<OrderRepository>,
    queue: Arc<DurableQueue>,
    clock: Arc<dyn Clock>,
) {
    tokio::spawn(async move {
        let mut sweep = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        info!("Reclaimer job started");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, stopping reclaimer job gracefully");
                    break;
                }
                _ = sweep.tick() => {
                    if let Err(err) = queue.reclaim_expired().await {
                        error!(error = %err, "Lease reclaim sweep failed");
                    }
                    if let Err(err) = sweep_stale_pending(&repo, &queue, &clock).await {
                        error!(error = %err, "Stale pending sweep failed");
                    }
                }
            }
        }

        info!("Reclaimer job stopped");
    });
}

/// Re-enqueue pending orders older than the grace period with no live job.
pub async fn sweep_stale_pending(
    repo: &OrderRepository,
    queue: &DurableQueue,
    clock: &Arc<dyn Clock>,
) -> crate::error::Result<u64> {
    let cutoff = clock.now() - ChronoDuration::seconds(PENDING_GRACE_SECS);
    let mut recovered = 0u64;

    for row in repo.stale_pending(cutoff).await? {
        if queue.has_live_job(row.id).await? {
            continue;
        }

        let payload = serde_json::to_value(ExecuteOrderRequest {
            order_type: row.order_type.clone(),
            token_in: row.token_in.clone(),
            token_out: row.token_out.clone(),
            amount: row.amount_in.clone(),
            slippage: row.slippage.clone(),
        })?;

        queue.enqueue(row.id, payload, &row.correlation_id).await?;
        info!(order_id = %row.id, "Re-enqueued stale pending order");
        recovered += 1;
    }

    Ok(recovered)
}
