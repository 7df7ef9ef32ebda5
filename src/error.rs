use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the engine's persistence and orchestration layers.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("order not found: {0}")]
    OrderNotFound(uuid::Uuid),

    #[error("invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failures raised while routing or executing an order against venues.
///
/// The worker classifies these into retriable (queue-scheduled retry) and
/// non-retriable (immediate terminal failure) kinds.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error("no venue returned a quote")]
    QuoteUnavailable,

    #[error("venue {venue} timed out after {elapsed_ms}ms")]
    VenueTimeout { venue: String, elapsed_ms: u64 },

    #[error("venue {venue} error: {reason}")]
    VenueTransport { venue: String, reason: String },

    #[error("unknown venue: {0}")]
    UnknownVenue(String),

    #[error("slippage exceeded: limit {limit}, actual {actual}")]
    SlippageExceeded { limit: Decimal, actual: Decimal },

    #[error("order validation failed: {0}")]
    Validation(String),

    #[error("job deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("corrupted order state: {0}")]
    CorruptState(String),
}

impl From<EngineError> for ExecutionError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidStateTransition { from, to } => ExecutionError::CorruptState(
                format!("invalid state transition: from {} to {}", from, to),
            ),
            other => ExecutionError::Infrastructure(other.to_string()),
        }
    }
}

impl ExecutionError {
    /// Whether the queue should schedule another attempt for this failure.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ExecutionError::QuoteUnavailable
                | ExecutionError::VenueTimeout { .. }
                | ExecutionError::VenueTransport { .. }
                | ExecutionError::UnknownVenue(_)
                | ExecutionError::Infrastructure(_)
        )
    }
}

/// A single field-level validation failure in a submission body.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Admission pipeline rejections, one variant per client-visible outcome.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("invalid request body")]
    InvalidBody(Vec<FieldError>),

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("queue is full, retry after {retry_after_secs}s")]
    QueueFull { retry_after_secs: u64 },

    #[error("idempotency key reused with a different body")]
    IdempotencyConflict,

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl From<EngineError> for AdmissionError {
    fn from(err: EngineError) -> Self {
        AdmissionError::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(ExecutionError::QuoteUnavailable.is_retriable());
        assert!(ExecutionError::VenueTimeout {
            venue: "alpha".into(),
            elapsed_ms: 5000
        }
        .is_retriable());
        assert!(ExecutionError::UnknownVenue("x".into()).is_retriable());
        assert!(!ExecutionError::SlippageExceeded {
            limit: Decimal::new(1, 2),
            actual: Decimal::new(5, 2)
        }
        .is_retriable());
        assert!(!ExecutionError::Validation("bad".into()).is_retriable());
        assert!(!ExecutionError::DeadlineExceeded { elapsed_ms: 30000 }.is_retriable());
    }
}
