use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use serde_json::json;

use gatehouse_auth::Requirement;

use crate::app::{AppState, dto, errors};
use crate::authz::Guard;
use crate::context::PrincipalContext;

pub fn router(guard: &Guard) -> Router {
    Router::new()
        .route("/", get(profile))
        .route("/permissions", get(permissions))
        .route("/sessions", get(sessions))
        .route_layer(guard.layer(Requirement::Authenticated))
}

/// The identity snapshot carried in the token. Display only.
pub async fn profile(Extension(principal): Extension<PrincipalContext>) -> impl IntoResponse {
    Json(json!({ "user": principal.principal().claims }))
}

/// Effective permissions as the server sees them right now.
pub async fn permissions(
    Extension(state): Extension<AppState>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    match state
        .auth
        .permissions()
        .effective_permissions(principal.user_id())
        .await
    {
        Ok(set) => {
            let ids: Vec<&str> = set.iter().map(|p| p.as_str()).collect();
            (StatusCode::OK, Json(json!({ "permissions": ids }))).into_response()
        }
        Err(err) => errors::store_error_to_response(err),
    }
}

pub async fn sessions(
    Extension(state): Extension<AppState>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    let now = Utc::now();
    let current = &principal.principal().session_token;
    match state.auth.sessions().list_for_user(principal.user_id()).await {
        Ok(sessions) => {
            let items: Vec<dto::SessionResponse> = sessions
                .into_iter()
                .filter(|s| s.is_active(now))
                .map(|s| {
                    let is_current = &s.token == current;
                    dto::SessionResponse::new(s, is_current)
                })
                .collect();
            (StatusCode::OK, Json(json!({ "sessions": items }))).into_response()
        }
        Err(err) => errors::store_error_to_response(err),
    }
}
