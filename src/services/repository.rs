//! Order persistence.
//!
//! Status transitions are conditional updates of the form
//! `SET status = next WHERE id = ? AND status = prior`, carrying the log
//! append and stage fields in the same statement. A zero-row update means a
//! duplicate delivery already advanced the order; callers re-read and
//! resume.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::entities::orders;
use crate::error::{EngineError, Result};
use crate::models::order::{LogEntry, OrderStatus, ValidatedOrder};
use crate::services::clock::Clock;

/// Cap on the persisted log history; older entries collapse into a
/// `truncated` marker at the head.
pub const MAX_LOG_ENTRIES: usize = 100;

/// Stage-specific columns written together with a status transition.
#[derive(Debug, Default, Clone)]
pub struct TransitionPatch {
    pub dex_used: Option<String>,
    pub tx_hash: Option<String>,
    pub amount_out: Option<String>,
    pub failure_reason: Option<String>,
    pub expected_price: Option<String>,
    pub executed_price: Option<String>,
    pub quotes: Option<BTreeMap<String, String>>,
}

#[derive(Debug)]
pub enum TransitionOutcome {
    /// The conditional update applied; carries the fresh row.
    Applied(orders::Model),
    /// Another delivery already moved the order on; carries the current row.
    Conflict(orders::Model),
}

pub struct OrderRepository {
    db: DatabaseConnection,
    clock: Arc<dyn Clock>,
}

impl OrderRepository {
    pub fn new(db: DatabaseConnection, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Insert the admitted order with status `pending` and its initial log
    /// entry.
    pub async fn create_pending(
        &self,
        id: Uuid,
        order: &ValidatedOrder,
        correlation_id: &str,
    ) -> Result<orders::Model> {
        let now = self.clock.now();
        let initial_log = vec![LogEntry::new("pending", now).with("message", "order accepted")];

        let model = orders::ActiveModel {
            id: Set(id),
            order_type: Set(order.order_type.to_string()),
            token_in: Set(order.token_in.clone()),
            token_out: Set(order.token_out.clone()),
            amount_in: Set(order.amount_in.to_string()),
            slippage: Set(order.slippage.to_string()),
            status: Set(OrderStatus::Pending.to_string()),
            amount_out: Set(None),
            dex_used: Set(None),
            tx_hash: Set(None),
            failure_reason: Set(None),
            expected_price: Set(None),
            executed_price: Set(None),
            quotes: Set(serde_json::json!({})),
            logs: Set(serde_json::to_value(&initial_log)?),
            correlation_id: Set(correlation_id.to_string()),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        Ok(model.insert(&self.db).await?)
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<orders::Model>> {
        Ok(orders::Entity::find_by_id(id).one(&self.db).await?)
    }

    /// Current lifecycle status of a row, parsed.
    pub fn status_of(model: &orders::Model) -> Result<OrderStatus> {
        model
            .status
            .parse::<OrderStatus>()
            .map_err(EngineError::Internal)
    }

    /// Atomically advance `id` from `from` to `to`, writing the stage patch
    /// and appending `log` in the same statement.
    ///
    /// An illegal edge in the lifecycle DAG is a programmer error and is
    /// rejected outright; a lost race returns the current row instead.
    pub async fn transition(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        patch: TransitionPatch,
        log: LogEntry,
    ) -> Result<TransitionOutcome> {
        if !from.can_transition_to(to) {
            error!(
                order_id = %id,
                from = %from,
                to = %to,
                "Impossible status transition requested"
            );
            return Err(EngineError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let current = self
            .find(id)
            .await?
            .ok_or(EngineError::OrderNotFound(id))?;

        if current.status != from.to_string() {
            return Ok(TransitionOutcome::Conflict(current));
        }

        let mut logs: Vec<LogEntry> = serde_json::from_value(current.logs.clone())?;
        logs.push(log);
        let logs = cap_logs(logs);

        let now = self.clock.now();
        let mut update = orders::Entity::update_many()
            .col_expr(orders::Column::Status, Expr::value(to.to_string()))
            .col_expr(
                orders::Column::Logs,
                Expr::value(serde_json::to_value(&logs)?),
            )
            .col_expr(orders::Column::UpdatedAt, Expr::value(now))
            .filter(orders::Column::Id.eq(id))
            .filter(orders::Column::Status.eq(from.to_string()));

        if let Some(dex_used) = patch.dex_used {
            update = update.col_expr(orders::Column::DexUsed, Expr::value(dex_used));
        }
        if let Some(tx_hash) = patch.tx_hash {
            update = update.col_expr(orders::Column::TxHash, Expr::value(tx_hash));
        }
        if let Some(amount_out) = patch.amount_out {
            update = update.col_expr(orders::Column::AmountOut, Expr::value(amount_out));
        }
        if let Some(failure_reason) = patch.failure_reason {
            update = update.col_expr(orders::Column::FailureReason, Expr::value(failure_reason));
        }
        if let Some(expected_price) = patch.expected_price {
            update = update.col_expr(orders::Column::ExpectedPrice, Expr::value(expected_price));
        }
        if let Some(executed_price) = patch.executed_price {
            update = update.col_expr(orders::Column::ExecutedPrice, Expr::value(executed_price));
        }
        if let Some(quotes) = patch.quotes {
            update = update.col_expr(
                orders::Column::Quotes,
                Expr::value(serde_json::to_value(&quotes)?),
            );
        }

        // tx_hash is only meaningful on submitted/confirmed rows; the log
        // history keeps the hash for failed executions
        if to == OrderStatus::Failed {
            update = update.col_expr(orders::Column::TxHash, Expr::value(Option::<String>::None));
        }

        let result = update.exec(&self.db).await?;

        let fresh = self
            .find(id)
            .await?
            .ok_or(EngineError::OrderNotFound(id))?;

        if result.rows_affected == 0 {
            warn!(
                order_id = %id,
                expected = %from,
                actual = %fresh.status,
                "Status transition lost the race, resuming from current state"
            );
            return Ok(TransitionOutcome::Conflict(fresh));
        }

        Ok(TransitionOutcome::Applied(fresh))
    }

    /// Append a log entry without changing status (retry announcements).
    pub async fn append_log(&self, id: Uuid, entry: LogEntry) -> Result<()> {
        let current = self
            .find(id)
            .await?
            .ok_or(EngineError::OrderNotFound(id))?;

        let mut logs: Vec<LogEntry> = serde_json::from_value(current.logs.clone())?;
        logs.push(entry);
        let logs = cap_logs(logs);

        orders::Entity::update_many()
            .col_expr(
                orders::Column::Logs,
                Expr::value(serde_json::to_value(&logs)?),
            )
            .col_expr(orders::Column::UpdatedAt, Expr::value(self.clock.now()))
            .filter(orders::Column::Id.eq(id))
            .exec(&self.db)
            .await?;

        Ok(())
    }

    /// Pending orders created before `cutoff`, oldest first. Fed to the
    /// janitor, which re-enqueues them after a lost enqueue.
    pub async fn stale_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<orders::Model>> {
        Ok(orders::Entity::find()
            .filter(orders::Column::Status.eq(OrderStatus::Pending.to_string()))
            .filter(orders::Column::CreatedAt.lt(cutoff))
            .order_by_asc(orders::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }
}

/// Enforce the log cap, folding dropped entries into one `truncated` marker
/// kept at the head.
fn cap_logs(mut logs: Vec<LogEntry>) -> Vec<LogEntry> {
    if logs.len() <= MAX_LOG_ENTRIES {
        return logs;
    }

    let mut already_dropped: u64 = 0;
    if logs.first().map(|e| e.stage.as_str()) == Some("truncated") {
        let marker = logs.remove(0);
        already_dropped = marker
            .fields
            .get("dropped")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
    }

    // Keep room for the marker itself
    let keep = MAX_LOG_ENTRIES - 1;
    let drop_count = logs.len() - keep;
    let timestamp = logs[drop_count - 1].timestamp;
    logs.drain(..drop_count);

    let marker = LogEntry::new("truncated", timestamp)
        .with("dropped", already_dropped + drop_count as u64);
    logs.insert(0, marker);
    logs
}
