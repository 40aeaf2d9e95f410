use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use serde_json::json;
use tracing::warn;

use crate::app::AppState;

/// Liveness plus a round trip to the store.
pub async fn health(Extension(state): Extension<AppState>) -> axum::response::Response {
    let store = state.auth.store();
    match store.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "store": store.backend_name() })),
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "store": store.backend_name() })),
            )
                .into_response()
        }
    }
}
