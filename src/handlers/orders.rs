//! GET /orders/{id} - read-only polling fallback

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::error;
use uuid::Uuid;

use crate::models::order::OrderResponse;
use crate::AppState;

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let order_id = match id.parse::<Uuid>() {
        Ok(order_id) => order_id,
        Err(_) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "success": false,
                    "error": "not_found",
                })),
            );
        }
    };

    match state.repo.find(order_id).await {
        Ok(Some(model)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "order": OrderResponse::from(model),
            })),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "success": false,
                "error": "not_found",
            })),
        ),
        Err(err) => {
            error!(order_id = %order_id, error = %err, "Failed to load order");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "success": false,
                    "error": "service_unavailable",
                })),
            )
        }
    }
}
