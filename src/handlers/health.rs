//! GET /health - dependency health report

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use tracing::warn;

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = match state.db.ping().await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "Database health probe failed");
            false
        }
    };

    let (queue_ok, depth) = match state.queue.depth().await {
        Ok(depth) => (true, Some(depth)),
        Err(err) => {
            warn!(error = %err, "Queue health probe failed");
            (false, None)
        }
    };

    let healthy = db_ok && queue_ok;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if healthy { "ok" } else { "degraded" },
            "services": {
                "db": if db_ok { "ok" } else { "down" },
                "queue": if queue_ok { "ok" } else { "down" },
            },
            "queueDepth": depth,
        })),
    )
}
