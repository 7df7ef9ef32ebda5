//! POST /orders/execute - submission endpoint
//!
//! Thin translation over the submission service: extract the client IP and
//! Idempotency-Key, run admission, and render the outcome with the
//! X-RateLimit-* headers every response carries.

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::net::SocketAddr;
use tracing::error;

use crate::error::{AdmissionError, FieldError};
use crate::models::order::ExecuteOrderRequest;
use crate::AppState;

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

pub async fn execute_order(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<ExecuteOrderRequest>, JsonRejection>,
) -> Response {
    let client_ip = addr.ip();
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let result = match body {
        Ok(Json(request)) => {
            state
                .submission
                .submit(client_ip, idempotency_key, request)
                .await
        }
        Err(rejection) => Err(AdmissionError::InvalidBody(vec![FieldError::new(
            "body",
            rejection.body_text(),
        )])),
    };

    let (status, retry_after, payload) = match result {
        Ok(outcome) => (
            StatusCode::OK,
            None,
            serde_json::json!({
                "success": true,
                "orderId": outcome.order_id,
            }),
        ),
        Err(AdmissionError::InvalidBody(fields)) => (
            StatusCode::BAD_REQUEST,
            None,
            serde_json::json!({
                "success": false,
                "error": "invalid_body",
                "fields": fields,
            }),
        ),
        Err(AdmissionError::RateLimited { retry_after_secs }) => (
            StatusCode::TOO_MANY_REQUESTS,
            Some(retry_after_secs),
            serde_json::json!({
                "success": false,
                "error": "rate_limited",
                "retryAfter": retry_after_secs,
            }),
        ),
        Err(AdmissionError::QueueFull { retry_after_secs }) => (
            StatusCode::TOO_MANY_REQUESTS,
            Some(retry_after_secs),
            serde_json::json!({
                "success": false,
                "error": "queue_full",
                "retryAfter": retry_after_secs,
            }),
        ),
        Err(AdmissionError::IdempotencyConflict) => (
            StatusCode::CONFLICT,
            None,
            serde_json::json!({
                "success": false,
                "error": "idempotency_conflict",
            }),
        ),
        Err(AdmissionError::Unavailable(reason)) => {
            error!(reason = %reason, "Submission unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                None,
                serde_json::json!({
                    "success": false,
                    "error": "service_unavailable",
                }),
            )
        }
    };

    let rate = state.submission.rate_snapshot(client_ip);
    let mut response = (status, Json(payload)).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert("X-RateLimit-Limit", HeaderValue::from(rate.limit as u64));
    response_headers.insert(
        "X-RateLimit-Remaining",
        HeaderValue::from(rate.remaining as u64),
    );
    response_headers.insert(
        "X-RateLimit-Reset",
        HeaderValue::from(rate.reset_after_secs),
    );
    if let Some(retry_after) = retry_after {
        response_headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    }

    response
}
