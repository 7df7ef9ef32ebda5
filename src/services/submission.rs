//! Submission admission pipeline.
//!
//! Ordered checks: validate → rate limit → backpressure → idempotency →
//! persist + enqueue → commit idempotency record. Each step short-circuits;
//! the successful response is the minimal order id and every later fact
//! flows through the subscription channel.

use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AdmissionError, FieldError};
use crate::models::order::{
    ExecuteOrderRequest, ValidatedOrder, MAX_IDEMPOTENCY_KEY_LENGTH,
};
use crate::services::idempotency::{IdempotencyRecord, IdempotencyStore};
use crate::services::queue::DurableQueue;
use crate::services::rate_limit::{RateLimitDecision, SlidingWindowRateLimiter};
use crate::services::repository::OrderRepository;

/// Waiting-depth threshold beyond which submissions are shed
pub const BACKPRESSURE_WAITING_LIMIT: u64 = 100;

/// Suggested client wait when the queue sheds load
const QUEUE_FULL_RETRY_AFTER_SECS: u64 = 5;

#[derive(Debug)]
pub struct SubmissionOutcome {
    pub order_id: Uuid,
    /// True when an idempotency replay short-circuited admission
    pub replayed: bool,
}

pub struct SubmissionService {
    repo: Arc<OrderRepository>,
    queue: Arc<DurableQueue>,
    rate_limiter: Arc<SlidingWindowRateLimiter>,
    idempotency: Arc<IdempotencyStore>,
}

impl SubmissionService {
    pub fn new(
        repo: Arc<OrderRepository>,
        queue: Arc<DurableQueue>,
        rate_limiter: Arc<SlidingWindowRateLimiter>,
        idempotency: Arc<IdempotencyStore>,
    ) -> Self {
        Self {
            repo,
            queue,
            rate_limiter,
            idempotency,
        }
    }

    /// Rate-limit header values for the caller's current window.
    pub fn rate_snapshot(&self, client_ip: IpAddr) -> RateLimitDecision {
        self.rate_limiter.snapshot(client_ip)
    }

    pub async fn submit(
        &self,
        client_ip: IpAddr,
        idempotency_key: Option<String>,
        request: ExecuteOrderRequest,
    ) -> Result<SubmissionOutcome, AdmissionError> {
        // 1. Validate
        if let Some(key) = &idempotency_key {
            if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LENGTH {
                return Err(AdmissionError::InvalidBody(vec![FieldError::new(
                    "Idempotency-Key",
                    format!("must be 1-{} characters", MAX_IDEMPOTENCY_KEY_LENGTH),
                )]));
            }
        }
        let validated =
            ValidatedOrder::try_from_request(&request).map_err(AdmissionError::InvalidBody)?;

        // 2. Rate limit per client IP
        let decision = self.rate_limiter.check_and_record(client_ip);
        if !decision.allowed {
            warn!(client_ip = %client_ip, "Submission rate limited");
            return Err(AdmissionError::RateLimited {
                retry_after_secs: decision.reset_after_secs.max(1),
            });
        }
        // Keep idle buckets from accumulating
        self.rate_limiter.cleanup_stale();

        // 3. Backpressure on queue depth
        let depth = self.queue.depth().await?;
        if depth.waiting > BACKPRESSURE_WAITING_LIMIT {
            warn!(waiting = depth.waiting, "Queue over backpressure threshold");
            return Err(AdmissionError::QueueFull {
                retry_after_secs: QUEUE_FULL_RETRY_AFTER_SECS,
            });
        }

        // 4. Idempotency: replay, conflict, or atomic reservation
        let fingerprint = IdempotencyStore::fingerprint(&request);
        let order_id = Uuid::new_v4();

        if let Some(key) = &idempotency_key {
            if let Some(existing) = self.idempotency.get(key) {
                return replay_or_conflict(existing, &fingerprint);
            }

            let winner = self.idempotency.reserve(
                key,
                IdempotencyRecord {
                    fingerprint: fingerprint.clone(),
                    order_id,
                },
            );
            if winner.order_id != order_id {
                // Lost a concurrent race for the same key
                return replay_or_conflict(winner, &fingerprint);
            }
        }

        // 5. Persist the pending row, then enqueue. Order matters: if the
        // enqueue fails the row stays pending and the janitor re-enqueues
        // it after the grace period.
        let correlation_id = Uuid::new_v4().to_string();
        let created = self
            .repo
            .create_pending(order_id, &validated, &correlation_id)
            .await;

        if let Err(err) = created {
            if let Some(key) = &idempotency_key {
                self.idempotency.release(key, order_id);
            }
            error!(error = %err, "Failed to persist admitted order");
            return Err(AdmissionError::Unavailable("persistence failed".to_string()));
        }

        let payload = serde_json::to_value(validated.to_request())
            .map_err(|e| AdmissionError::Unavailable(e.to_string()))?;
        if let Err(err) = self
            .queue
            .enqueue(order_id, payload, &correlation_id)
            .await
        {
            // Row exists; the janitor will re-enqueue it
            warn!(
                order_id = %order_id,
                error = %err,
                "Enqueue failed after row creation, deferring to janitor"
            );
        }

        info!(
            order_id = %order_id,
            correlation_id = %correlation_id,
            client_ip = %client_ip,
            token_in = %request.token_in,
            token_out = %request.token_out,
            "Order admitted"
        );

        Ok(SubmissionOutcome {
            order_id,
            replayed: false,
        })
    }
}

fn replay_or_conflict(
    record: IdempotencyRecord,
    fingerprint: &str,
) -> Result<SubmissionOutcome, AdmissionError> {
    if record.fingerprint == fingerprint {
        info!(order_id = %record.order_id, "Idempotent replay");
        Ok(SubmissionOutcome {
            order_id: record.order_id,
            replayed: true,
        })
    } else {
        Err(AdmissionError::IdempotencyConflict)
    }
}
