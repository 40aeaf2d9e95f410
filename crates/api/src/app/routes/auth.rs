//! Login, logout and password lifecycle.
//!
//! Login and both reset endpoints are public. Their responses are shaped so a
//! caller cannot tell a registered email from an unknown one.

use axum::{
    Json, Router,
    extract::Extension,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::post,
};
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::error;

use gatehouse_auth::Requirement;

use crate::app::{AppState, dto, errors};
use crate::authz::Guard;
use crate::context::{PrincipalContext, session_origin};
use crate::middleware::{SESSION_COOKIE, extract_token};

pub fn router(guard: &Guard) -> Router {
    Router::new()
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/password-reset/request", post(request_password_reset))
        .route("/password-reset/complete", post(complete_password_reset))
        .route(
            "/password",
            post(change_password).route_layer(guard.layer(Requirement::Authenticated)),
        )
}

pub async fn login(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Json(body): Json<dto::LoginRequest>,
) -> axum::response::Response {
    let now = Utc::now();
    let outcome = match state
        .auth
        .login(&body.email, &body.password, session_origin(&headers), now)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => return errors::auth_error_to_response(err),
    };

    let cookie = session_cookie(
        &outcome.token,
        outcome.session.expires_at - now,
        state.cookie_secure,
    );
    let body = dto::LoginResponse {
        ok: true,
        user: dto::UserResponse::from(&outcome.user),
        token: outcome.token,
    };
    (StatusCode::OK, [(header::SET_COOKIE, cookie)], Json(body)).into_response()
}

/// Always succeeds and always clears the cookie.
pub async fn logout(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
) -> axum::response::Response {
    if let Err(err) = state.auth.logout(extract_token(&headers), Utc::now()).await {
        error!(error = %err, "logout could not revoke the session");
    }
    let cookie = session_cookie("", Duration::zero(), state.cookie_secure);
    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "ok": true })),
    )
        .into_response()
}

pub async fn request_password_reset(
    Extension(state): Extension<AppState>,
    Json(body): Json<dto::PasswordResetRequest>,
) -> axum::response::Response {
    state.auth.request_password_reset(&body.email, Utc::now()).await;
    (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
}

pub async fn complete_password_reset(
    Extension(state): Extension<AppState>,
    Json(body): Json<dto::PasswordResetComplete>,
) -> axum::response::Response {
    match state
        .auth
        .complete_password_reset(&body.token, &body.password, Utc::now())
        .await
    {
        Ok(_) => (StatusCode::OK, Json(json!({ "ok": true }))).into_response(),
        Err(err) => errors::auth_error_to_response(err),
    }
}

/// Every session of the caller, the current one included, ends here.
pub async fn change_password(
    Extension(state): Extension<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::ChangePasswordRequest>,
) -> axum::response::Response {
    match state
        .auth
        .change_password(
            principal.user_id(),
            &body.current_password,
            &body.new_password,
            Utc::now(),
        )
        .await
    {
        Ok(revoked) => {
            let cookie = session_cookie("", Duration::zero(), state.cookie_secure);
            (
                StatusCode::OK,
                [(header::SET_COOKIE, cookie)],
                Json(json!({ "ok": true, "revokedSessions": revoked })),
            )
                .into_response()
        }
        Err(err) => errors::auth_error_to_response(err),
    }
}

fn session_cookie(token: &str, max_age: Duration, secure: bool) -> String {
    let secure = if secure { "; Secure" } else { "" };
    format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}{secure}",
        max_age.num_seconds().max(0)
    )
}
