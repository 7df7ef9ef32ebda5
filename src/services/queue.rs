//! Database-backed durable job queue with at-least-once delivery.
//!
//! Jobs are rows; a lease is a conditional update that flips a due
//! `waiting`/`retry_scheduled` row to `active` under the leasing worker's
//! id. A crashed worker's lease expires after the visibility timeout and
//! the janitor returns the job to `waiting` — the sole source of duplicate
//! delivery, which the worker's idempotent transitions absorb.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::entities::jobs;
use crate::error::{EngineError, Result};
use crate::services::clock::Clock;

/// Jobs a worker may claim per lease scan
const LEASE_SCAN_LIMIT: u64 = 8;

/// Global throughput ceiling across all workers
pub const GLOBAL_JOBS_PER_MINUTE: usize = 100;

/// How long an `active` lease may go without completing before the janitor
/// reclaims it
pub const VISIBILITY_TIMEOUT_SECS: i64 = 60;

/// Queue-owned job states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    Succeeded,
    FailedTerminal,
    RetryScheduled,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Succeeded => "succeeded",
            JobState::FailedTerminal => "failed_terminal",
            JobState::RetryScheduled => "retry_scheduled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "succeeded" => Ok(JobState::Succeeded),
            "failed_terminal" => Ok(JobState::FailedTerminal),
            "retry_scheduled" => Ok(JobState::RetryScheduled),
            _ => Err(format!("Unknown job state: {}", s)),
        }
    }
}

/// Snapshot of queue occupancy, feeds backpressure and /health
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueDepth {
    pub waiting: u64,
    pub active: u64,
    pub retrying: u64,
    pub failed_terminal: u64,
}

#[derive(Debug)]
pub enum NackOutcome {
    RetryScheduled {
        attempt: u32,
        max_attempts: u32,
        next_run_at: DateTime<Utc>,
    },
    FailedTerminal,
}

pub struct DurableQueue {
    db: DatabaseConnection,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    throughput: Mutex<VecDeque<DateTime<Utc>>>,
}

impl DurableQueue {
    pub fn new(db: DatabaseConnection, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
        Self {
            db,
            clock,
            max_retries,
            throughput: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue a job for `order_id`. Idempotent: while a non-terminal job
    /// exists for the order, the existing job id is returned unchanged.
    pub async fn enqueue(
        &self,
        order_id: Uuid,
        payload: serde_json::Value,
        correlation_id: &str,
    ) -> Result<i32> {
        if let Some(existing) = self.live_job(order_id).await? {
            debug!(order_id = %order_id, job_id = existing.id, "Enqueue is a no-op, live job exists");
            return Ok(existing.id);
        }

        let now = self.clock.now();
        let model = jobs::ActiveModel {
            order_id: Set(order_id),
            payload: Set(payload),
            state: Set(JobState::Waiting.to_string()),
            attempt: Set(0),
            correlation_id: Set(correlation_id.to_string()),
            next_run_at: Set(now.into()),
            locked_by: Set(None),
            locked_at: Set(None),
            last_error: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        };

        let inserted = model.insert(&self.db).await?;
        debug!(order_id = %order_id, job_id = inserted.id, "Job enqueued");
        Ok(inserted.id)
    }

    /// Claim one due job for `worker_id`, or None when nothing is due, a
    /// concurrent worker won every race, or the global throughput window is
    /// exhausted.
    pub async fn lease(&self, worker_id: &str) -> Result<Option<jobs::Model>> {
        let now = self.clock.now();
        if !self.throughput_permit(now) {
            return Ok(None);
        }

        let candidates = jobs::Entity::find()
            .filter(
                jobs::Column::State.is_in([
                    JobState::Waiting.to_string(),
                    JobState::RetryScheduled.to_string(),
                ]),
            )
            .filter(jobs::Column::NextRunAt.lte(now))
            .order_by_asc(jobs::Column::NextRunAt)
            .limit(LEASE_SCAN_LIMIT)
            .all(&self.db)
            .await?;

        for candidate in candidates {
            let claimed = jobs::Entity::update_many()
                .col_expr(jobs::Column::State, Expr::value(JobState::Active.to_string()))
                .col_expr(jobs::Column::LockedBy, Expr::value(worker_id.to_string()))
                .col_expr(jobs::Column::LockedAt, Expr::value(now))
                .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
                .filter(jobs::Column::Id.eq(candidate.id))
                .filter(jobs::Column::State.eq(candidate.state.clone()))
                .exec(&self.db)
                .await?;

            if claimed.rows_affected == 1 {
                self.record_throughput(now);
                let fresh = jobs::Entity::find_by_id(candidate.id)
                    .one(&self.db)
                    .await?
                    .ok_or_else(|| {
                        EngineError::Internal(format!("leased job {} vanished", candidate.id))
                    })?;
                debug!(job_id = fresh.id, worker_id = %worker_id, attempt = fresh.attempt, "Job leased");
                return Ok(Some(fresh));
            }
        }

        Ok(None)
    }

    /// Terminal success.
    pub async fn ack(&self, job_id: i32) -> Result<()> {
        let now = self.clock.now();
        jobs::Entity::update_many()
            .col_expr(
                jobs::Column::State,
                Expr::value(JobState::Succeeded.to_string()),
            )
            .col_expr(jobs::Column::LockedBy, Expr::value(Option::<String>::None))
            .col_expr(
                jobs::Column::LockedAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Id.eq(job_id))
            .filter(jobs::Column::State.eq(JobState::Active.to_string()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Record a failed delivery. Schedules an exponential-backoff retry
    /// until the retry budget is exhausted, then dead-letters the job.
    pub async fn nack(&self, job: &jobs::Model, error: &str) -> Result<NackOutcome> {
        let now = self.clock.now();

        if (job.attempt as u32) < self.max_retries {
            let attempt = job.attempt as u32 + 1;
            let delay = backoff_delay_secs(attempt);
            let next_run_at = now + ChronoDuration::seconds(delay);

            jobs::Entity::update_many()
                .col_expr(
                    jobs::Column::State,
                    Expr::value(JobState::RetryScheduled.to_string()),
                )
                .col_expr(jobs::Column::Attempt, Expr::value(attempt as i32))
                .col_expr(jobs::Column::NextRunAt, Expr::value(next_run_at))
                .col_expr(jobs::Column::LastError, Expr::value(error.to_string()))
                .col_expr(jobs::Column::LockedBy, Expr::value(Option::<String>::None))
                .col_expr(
                    jobs::Column::LockedAt,
                    Expr::value(Option::<DateTime<Utc>>::None),
                )
                .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
                .filter(jobs::Column::Id.eq(job.id))
                .exec(&self.db)
                .await?;

            info!(
                job_id = job.id,
                order_id = %job.order_id,
                attempt,
                delay_secs = delay,
                "Retry scheduled"
            );
            return Ok(NackOutcome::RetryScheduled {
                attempt,
                max_attempts: self.max_retries,
                next_run_at,
            });
        }

        self.fail_terminal(job.id, error).await?;
        Ok(NackOutcome::FailedTerminal)
    }

    /// Dead-letter a job outright (non-retriable failure or deadline).
    pub async fn fail_terminal(&self, job_id: i32, error: &str) -> Result<()> {
        let now = self.clock.now();
        jobs::Entity::update_many()
            .col_expr(
                jobs::Column::State,
                Expr::value(JobState::FailedTerminal.to_string()),
            )
            .col_expr(jobs::Column::LastError, Expr::value(error.to_string()))
            .col_expr(jobs::Column::LockedBy, Expr::value(Option::<String>::None))
            .col_expr(
                jobs::Column::LockedAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Id.eq(job_id))
            .exec(&self.db)
            .await?;
        info!(job_id, error, "Job dead-lettered");
        Ok(())
    }

    pub async fn depth(&self) -> Result<QueueDepth> {
        Ok(QueueDepth {
            waiting: self.count_state(JobState::Waiting).await?,
            active: self.count_state(JobState::Active).await?,
            retrying: self.count_state(JobState::RetryScheduled).await?,
            failed_terminal: self.count_state(JobState::FailedTerminal).await?,
        })
    }

    /// Return expired `active` leases to `waiting`. Called by the janitor.
    pub async fn reclaim_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let cutoff = now - ChronoDuration::seconds(VISIBILITY_TIMEOUT_SECS);

        let result = jobs::Entity::update_many()
            .col_expr(jobs::Column::State, Expr::value(JobState::Waiting.to_string()))
            .col_expr(jobs::Column::LockedBy, Expr::value(Option::<String>::None))
            .col_expr(
                jobs::Column::LockedAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(jobs::Column::NextRunAt, Expr::value(now))
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::State.eq(JobState::Active.to_string()))
            .filter(jobs::Column::LockedAt.lt(cutoff))
            .exec(&self.db)
            .await?;

        if result.rows_affected > 0 {
            info!(count = result.rows_affected, "Reclaimed expired job leases");
        }
        Ok(result.rows_affected)
    }

    /// Whether `order_id` currently has a non-terminal job.
    pub async fn has_live_job(&self, order_id: Uuid) -> Result<bool> {
        Ok(self.live_job(order_id).await?.is_some())
    }

    async fn live_job(&self, order_id: Uuid) -> Result<Option<jobs::Model>> {
        Ok(jobs::Entity::find()
            .filter(jobs::Column::OrderId.eq(order_id))
            .filter(
                jobs::Column::State.is_in([
                    JobState::Waiting.to_string(),
                    JobState::Active.to_string(),
                    JobState::RetryScheduled.to_string(),
                ]),
            )
            .one(&self.db)
            .await?)
    }

    async fn count_state(&self, state: JobState) -> Result<u64> {
        Ok(jobs::Entity::find()
            .filter(jobs::Column::State.eq(state.to_string()))
            .count(&self.db)
            .await?)
    }

    fn throughput_permit(&self, now: DateTime<Utc>) -> bool {
        let window_start = now - ChronoDuration::seconds(60);
        let mut window = self.throughput.lock();
        while window.front().map(|t| *t <= window_start).unwrap_or(false) {
            window.pop_front();
        }
        window.len() < GLOBAL_JOBS_PER_MINUTE
    }

    fn record_throughput(&self, now: DateTime<Utc>) {
        self.throughput.lock().push_back(now);
    }
}

/// Backoff schedule: retry n runs 2^n seconds after the failure (2s, 4s, 8s).
fn backoff_delay_secs(attempt: u32) -> i64 {
    1i64 << attempt
}
