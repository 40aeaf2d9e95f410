//! Role, permission and user administration.
//!
//! Every route is guarded by catalog permissions and re-checked against the
//! store on each request.

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use chrono::Utc;
use serde_json::json;
use tracing::info;

use gatehouse_auth::{NewRole, PermissionId, Requirement};
use gatehouse_core::{RoleId, UserId};
use gatehouse_infra::seed::ids;
use gatehouse_infra::store::{RbacStore, UserStore};
use gatehouse_infra::{AuthError, StoreError};

use crate::app::{AppState, dto, errors};
use crate::authz::Guard;
use crate::context::{PrincipalContext, RequestIdentity};

pub fn router(guard: &Guard) -> Router {
    Router::new()
        .route(
            "/permissions",
            get(list_permissions).route_layer(guard.layer(Requirement::one(ids::PERMISSION_READ))),
        )
        .route(
            "/roles",
            get(list_roles).route_layer(guard.layer(Requirement::one(ids::ROLE_READ))),
        )
        .route(
            "/roles",
            post(create_role).route_layer(guard.layer(Requirement::one(ids::ROLE_CREATE))),
        )
        .route(
            "/roles/:id",
            delete(delete_role).route_layer(guard.layer(Requirement::one(ids::ROLE_DELETE))),
        )
        .route(
            "/roles/:id/permissions/:perm",
            put(grant_permission)
                .delete(revoke_permission)
                .route_layer(guard.layer(Requirement::one(ids::ROLE_UPDATE))),
        )
        .route(
            "/users",
            post(create_user).route_layer(guard.layer(Requirement::one(ids::USER_CREATE))),
        )
        // Guarded in the handler.
        .route("/users/:id/permissions", get(user_permissions))
        .route(
            "/users/:id/roles",
            post(assign_role).route_layer(guard.layer(Requirement::one(ids::USER_UPDATE))),
        )
        .route(
            "/users/:id/roles/:role_id",
            delete(remove_role).route_layer(guard.layer(Requirement::one(ids::USER_UPDATE))),
        )
        .route(
            "/users/:id/sessions",
            delete(revoke_sessions).route_layer(guard.layer(Requirement::any([
                ids::USER_UPDATE,
                ids::SESSION_REVOKE,
            ]))),
        )
}

pub async fn list_permissions(Extension(state): Extension<AppState>) -> axum::response::Response {
    match state.auth.store().list_permissions().await {
        Ok(catalog) => {
            let items: Vec<dto::PermissionResponse> = catalog.into_iter().map(Into::into).collect();
            (StatusCode::OK, Json(items)).into_response()
        }
        Err(err) => errors::store_error_to_response(err),
    }
}

pub async fn list_roles(Extension(state): Extension<AppState>) -> axum::response::Response {
    match state.auth.store().list_roles().await {
        Ok(roles) => {
            let items: Vec<dto::RoleResponse> = roles.into_iter().map(Into::into).collect();
            (StatusCode::OK, Json(items)).into_response()
        }
        Err(err) => errors::store_error_to_response(err),
    }
}

pub async fn create_role(
    Extension(state): Extension<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::CreateRoleRequest>,
) -> axum::response::Response {
    let new_role = NewRole {
        name: body.name,
        description: body.description,
    };
    let new_role = match new_role.normalized() {
        Ok(v) => v,
        Err(err) => return errors::domain_error_to_response(err),
    };

    match state.auth.store().create_role(new_role, Utc::now()).await {
        Ok(role) => {
            info!(actor = %principal.user_id(), role_id = %role.id, "role created");
            (StatusCode::CREATED, Json(dto::RoleResponse::from(role))).into_response()
        }
        Err(err) => errors::store_error_to_response(err),
    }
}

/// `409` while any user still holds the role.
pub async fn delete_role(
    Extension(state): Extension<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let role_id: RoleId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid role id"),
    };

    match state.auth.store().delete_role(role_id).await {
        Ok(()) => {
            info!(actor = %principal.user_id(), role_id = %role_id, "role deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => errors::store_error_to_response(err),
    }
}

pub async fn grant_permission(
    Extension(state): Extension<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Path((id, perm)): Path<(String, String)>,
) -> axum::response::Response {
    let (role_id, permission) = match parse_role_permission(&id, perm) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match state.auth.store().grant_permission(role_id, &permission).await {
        Ok(granted) => {
            if granted {
                info!(actor = %principal.user_id(), role_id = %role_id, permission = %permission, "permission granted");
            }
            (StatusCode::OK, Json(json!({ "granted": granted }))).into_response()
        }
        Err(err) => errors::store_error_to_response(err),
    }
}

pub async fn revoke_permission(
    Extension(state): Extension<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Path((id, perm)): Path<(String, String)>,
) -> axum::response::Response {
    let (role_id, permission) = match parse_role_permission(&id, perm) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match state.auth.store().revoke_permission(role_id, &permission).await {
        Ok(revoked) => {
            if revoked {
                info!(actor = %principal.user_id(), role_id = %role_id, permission = %permission, "permission revoked");
            }
            (StatusCode::OK, Json(json!({ "revoked": revoked }))).into_response()
        }
        Err(err) => errors::store_error_to_response(err),
    }
}

pub async fn create_user(
    Extension(state): Extension<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::CreateUserRequest>,
) -> axum::response::Response {
    match state
        .auth
        .register_user(body.user, &body.password, Utc::now())
        .await
    {
        Ok(user) => {
            info!(actor = %principal.user_id(), user_id = %user.id, "user created");
            (StatusCode::CREATED, Json(dto::UserResponse::from(&user))).into_response()
        }
        Err(err) => errors::auth_error_to_response(err),
    }
}

/// Requires both `user:read` and `role:read`; a denial names what is missing.
pub async fn user_permissions(
    Extension(state): Extension<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let requirement = Requirement::all([ids::USER_READ, ids::ROLE_READ]);
    let result = state
        .guard
        .protect(&identity, &requirement, |_| async {
            let user_id: UserId = id.parse()?;
            if state.auth.store().get_user(user_id).await?.is_none() {
                return Err(AuthError::Store(StoreError::NotFound(format!("user {user_id}"))));
            }
            let set = state.auth.permissions().effective_permissions(user_id).await?;
            Ok::<_, AuthError>((user_id, set))
        })
        .await;

    match result {
        Ok((user_id, set)) => {
            let ids: Vec<&str> = set.iter().map(|p| p.as_str()).collect();
            (
                StatusCode::OK,
                Json(json!({ "userId": user_id, "permissions": ids })),
            )
                .into_response()
        }
        Err(err) => errors::auth_error_to_response(err),
    }
}

/// Idempotent: a second assignment answers `200` with `assigned: false`.
pub async fn assign_role(
    Extension(state): Extension<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::AssignRoleRequest>,
) -> axum::response::Response {
    let user_id: UserId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid user id"),
    };
    let role_id: RoleId = match body.role_id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid role id"),
    };

    match state
        .auth
        .store()
        .assign_role(user_id, role_id, Some(principal.user_id()), Utc::now())
        .await
    {
        Ok(true) => {
            info!(actor = %principal.user_id(), user_id = %user_id, role_id = %role_id, "role assigned");
            (StatusCode::CREATED, Json(json!({ "assigned": true }))).into_response()
        }
        Ok(false) => (StatusCode::OK, Json(json!({ "assigned": false }))).into_response(),
        Err(err) => errors::store_error_to_response(err),
    }
}

pub async fn remove_role(
    Extension(state): Extension<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Path((id, role_id)): Path<(String, String)>,
) -> axum::response::Response {
    let user_id: UserId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid user id"),
    };
    let role_id: RoleId = match role_id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid role id"),
    };

    match state.auth.store().remove_role(user_id, role_id).await {
        Ok(removed) => {
            if removed {
                info!(actor = %principal.user_id(), user_id = %user_id, role_id = %role_id, "role removed");
            }
            (StatusCode::OK, Json(json!({ "removed": removed }))).into_response()
        }
        Err(err) => errors::store_error_to_response(err),
    }
}

pub async fn revoke_sessions(
    Extension(state): Extension<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let user_id: UserId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid user id"),
    };

    match state.auth.sessions().revoke_all(user_id).await {
        Ok(revoked) => {
            info!(actor = %principal.user_id(), user_id = %user_id, revoked, "sessions revoked by administrator");
            (StatusCode::OK, Json(json!({ "revoked": revoked }))).into_response()
        }
        Err(err) => errors::store_error_to_response(err),
    }
}

fn parse_role_permission(
    id: &str,
    perm: String,
) -> Result<(RoleId, PermissionId), axum::response::Response> {
    let role_id: RoleId = id
        .parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid role id"))?;
    let permission = PermissionId::parse(perm).map_err(errors::domain_error_to_response)?;
    Ok((role_id, permission))
}
