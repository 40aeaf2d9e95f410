use axum::Router;

use crate::authz::Guard;

pub mod admin;
pub mod auth;
pub mod me;
pub mod system;

/// Router for every endpoint behind the identity middleware.
///
/// Guards are attached per route; public routes carry none.
pub fn router(guard: &Guard) -> Router {
    Router::new()
        .nest("/auth", auth::router(guard))
        .nest("/me", me::router(guard))
        .nest("/admin", admin::router(guard))
}
