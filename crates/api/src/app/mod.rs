//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store selection, catalog seeding, background sweeper
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};

use gatehouse_infra::AuthService;

use crate::authz::Guard;
use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub guard: Guard,
    /// Add `Secure` to the session cookie.
    pub cookie_secure: bool,
}

impl AppState {
    pub fn new(auth: Arc<AuthService>) -> Self {
        Self {
            guard: Guard::new(auth.clone()),
            auth,
            cookie_secure: true,
        }
    }

    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(state: AppState) -> Router {
    let auth_state = middleware::AuthState {
        auth: state.auth.clone(),
    };

    let api = routes::router(&state.guard).layer(axum::middleware::from_fn_with_state(
        auth_state,
        middleware::auth_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(api)
        .layer(Extension(state))
}
