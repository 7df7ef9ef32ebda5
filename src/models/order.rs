//! Order types, lifecycle statuses and wire-format models.
//!
//! Status progresses: pending → routing → building → submitted → confirmed
//!                                                              ↘ failed
//! Any non-terminal status may fall to failed; everything else is rejected
//! by the repository as a programmer error.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::entities::orders;
use crate::error::FieldError;

/// Order types accepted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "market"),
        }
    }
}

impl std::str::FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "market" => Ok(OrderType::Market),
            _ => Err(format!("Unknown order type: {}", s)),
        }
    }
}

/// Lifecycle status values persisted on the order row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Admitted, waiting for a worker
    Pending,
    /// Fetching quotes from venues
    Routing,
    /// Best venue selected, building the execution
    Building,
    /// Sent to the venue, transaction hash known
    Submitted,
    /// Settled within the slippage tolerance
    Confirmed,
    /// Terminal failure
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Confirmed | OrderStatus::Failed)
    }

    /// Whether `next` is a legal successor of `self` in the lifecycle DAG.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Routing) => true,
            (Routing, Building) => true,
            (Building, Submitted) => true,
            (Submitted, Confirmed) => true,
            (s, Failed) if !s.is_terminal() => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Routing => "routing",
            OrderStatus::Building => "building",
            OrderStatus::Submitted => "submitted",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "routing" => Ok(OrderStatus::Routing),
            "building" => Ok(OrderStatus::Building),
            "submitted" => Ok(OrderStatus::Submitted),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "failed" => Ok(OrderStatus::Failed),
            _ => Err(format!("Unknown order status: {}", s)),
        }
    }
}

/// One append-only entry in the order's log history.
///
/// `fields` carries the stage-specific payload (quotes for routing, txHash
/// for submitted, reason + attempt for failures and retries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl LogEntry {
    pub fn new(stage: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            stage: stage.to_string(),
            timestamp,
            fields: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// POST /orders/execute request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOrderRequest {
    #[serde(rename = "type")]
    pub order_type: String,
    pub token_in: String,
    pub token_out: String,
    pub amount: String,
    pub slippage: String,
}

/// Maximum token symbol length accepted at admission
pub const MAX_TOKEN_LENGTH: usize = 64;

/// Maximum Idempotency-Key length accepted at admission
pub const MAX_IDEMPOTENCY_KEY_LENGTH: usize = 128;

/// A submission body that passed admission validation.
#[derive(Debug, Clone)]
pub struct ValidatedOrder {
    pub order_type: OrderType,
    pub token_in: String,
    pub token_out: String,
    pub amount_in: Decimal,
    pub slippage: Decimal,
}

impl ValidatedOrder {
    /// Validate a raw request body, collecting every field error.
    pub fn try_from_request(req: &ExecuteOrderRequest) -> Result<Self, Vec<FieldError>> {
        let mut errors = Vec::new();

        let order_type = match req.order_type.parse::<OrderType>() {
            Ok(t) => Some(t),
            Err(_) => {
                errors.push(FieldError::new("type", "must be \"market\""));
                None
            }
        };

        if req.token_in.is_empty() || req.token_in.len() > MAX_TOKEN_LENGTH {
            errors.push(FieldError::new(
                "tokenIn",
                format!("must be 1-{} characters", MAX_TOKEN_LENGTH),
            ));
        }
        if req.token_out.is_empty() || req.token_out.len() > MAX_TOKEN_LENGTH {
            errors.push(FieldError::new(
                "tokenOut",
                format!("must be 1-{} characters", MAX_TOKEN_LENGTH),
            ));
        }
        if !req.token_in.is_empty() && req.token_in == req.token_out {
            errors.push(FieldError::new("tokenOut", "must differ from tokenIn"));
        }

        let amount_in = match req.amount.parse::<Decimal>() {
            Ok(a) if a > Decimal::ZERO => Some(a),
            Ok(_) => {
                errors.push(FieldError::new("amount", "must be greater than zero"));
                None
            }
            Err(_) => {
                errors.push(FieldError::new("amount", "must be a decimal string"));
                None
            }
        };

        let slippage = match req.slippage.parse::<Decimal>() {
            Ok(s) if s >= Decimal::ZERO && s <= Decimal::new(5, 1) => Some(s),
            Ok(_) => {
                errors.push(FieldError::new("slippage", "must be within [0, 0.5]"));
                None
            }
            Err(_) => {
                errors.push(FieldError::new("slippage", "must be a decimal string"));
                None
            }
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Self {
            order_type: order_type.unwrap(),
            token_in: req.token_in.clone(),
            token_out: req.token_out.clone(),
            amount_in: amount_in.unwrap(),
            slippage: slippage.unwrap(),
        })
    }

    pub fn to_request(&self) -> ExecuteOrderRequest {
        ExecuteOrderRequest {
            order_type: self.order_type.to_string(),
            token_in: self.token_in.clone(),
            token_out: self.token_out.clone(),
            amount: self.amount_in.to_string(),
            slippage: self.slippage.to_string(),
        }
    }
}

/// Event published on the order's bus topic after every persisted change.
///
/// Also the wire shape of `status_update` stream messages. `status` is a
/// lifecycle status, or `retry_scheduled` for queue-driven retry
/// announcements which leave the persisted status untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order_id: Uuid,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dex_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_out: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quotes: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
}

impl OrderEvent {
    pub fn transition(order_id: Uuid, status: OrderStatus, timestamp: DateTime<Utc>) -> Self {
        Self {
            order_id,
            status: status.to_string(),
            timestamp,
            dex_used: None,
            tx_hash: None,
            amount_out: None,
            executed_price: None,
            failure_reason: None,
            quotes: None,
            attempt: None,
            max_attempts: None,
            next_run_at: None,
        }
    }

    pub fn retry_scheduled(
        order_id: Uuid,
        attempt: u32,
        max_attempts: u32,
        next_run_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id,
            status: "retry_scheduled".to_string(),
            timestamp,
            dex_used: None,
            tx_hash: None,
            amount_out: None,
            executed_price: None,
            failure_reason: None,
            quotes: None,
            attempt: Some(attempt),
            max_attempts: Some(max_attempts),
            next_run_at: Some(next_run_at),
        }
    }
}

/// Full order row for GET /orders/{id} responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub order_type: String,
    pub token_in: String,
    pub token_out: String,
    pub amount_in: String,
    pub slippage: String,
    pub status: String,
    pub amount_out: Option<String>,
    pub dex_used: Option<String>,
    pub tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub quotes: serde_json::Value,
    pub logs: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

impl From<orders::Model> for OrderResponse {
    fn from(model: orders::Model) -> Self {
        Self {
            id: model.id,
            order_type: model.order_type,
            token_in: model.token_in,
            token_out: model.token_out,
            amount_in: model.amount_in,
            slippage: model.slippage,
            status: model.status,
            amount_out: model.amount_out,
            dex_used: model.dex_used,
            tx_hash: model.tx_hash,
            failure_reason: model.failure_reason,
            quotes: model.quotes,
            logs: model.logs,
            created_at: model.created_at.to_rfc3339(),
            updated_at: model.updated_at.to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ExecuteOrderRequest {
        ExecuteOrderRequest {
            order_type: "market".to_string(),
            token_in: "SOL".to_string(),
            token_out: "USDC".to_string(),
            amount: "1.5".to_string(),
            slippage: "0.01".to_string(),
        }
    }

    #[test]
    fn lifecycle_dag_accepts_forward_path() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Routing));
        assert!(Routing.can_transition_to(Building));
        assert!(Building.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Confirmed));
        for s in [Pending, Routing, Building, Submitted] {
            assert!(s.can_transition_to(Failed));
        }
    }

    #[test]
    fn lifecycle_dag_rejects_regressions_and_skips() {
        use OrderStatus::*;
        assert!(!Routing.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Building));
        assert!(!Pending.can_transition_to(Confirmed));
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Routing));
        assert!(!Confirmed.can_transition_to(Routing));
    }

    #[test]
    fn validates_happy_body() {
        let validated = ValidatedOrder::try_from_request(&request()).unwrap();
        assert_eq!(validated.order_type, OrderType::Market);
        assert_eq!(validated.amount_in.to_string(), "1.5");
    }

    #[test]
    fn rejects_identical_tokens() {
        let mut req = request();
        req.token_out = "SOL".to_string();
        let errors = ValidatedOrder::try_from_request(&req).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "tokenOut"));
    }

    #[test]
    fn rejects_zero_amount_and_out_of_range_slippage() {
        let mut req = request();
        req.amount = "0".to_string();
        req.slippage = "0.51".to_string();
        let errors = ValidatedOrder::try_from_request(&req).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn rejects_unknown_type_and_garbage_decimal() {
        let mut req = request();
        req.order_type = "limit".to_string();
        req.amount = "abc".to_string();
        let errors = ValidatedOrder::try_from_request(&req).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "type"));
        assert!(errors.iter().any(|e| e.field == "amount"));
    }

    #[test]
    fn preserves_amount_precision_through_validation() {
        let mut req = request();
        req.amount = "0.123456789012".to_string();
        let validated = ValidatedOrder::try_from_request(&req).unwrap();
        assert_eq!(validated.amount_in.to_string(), "0.123456789012");
    }

    #[test]
    fn retry_event_carries_schedule_fields() {
        let now = Utc::now();
        let event = OrderEvent::retry_scheduled(Uuid::new_v4(), 2, 3, now, now);
        assert_eq!(event.status, "retry_scheduled");
        assert_eq!(event.attempt, Some(2));
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("maxAttempts").is_some());
        assert!(json.get("txHash").is_none());
    }
}
