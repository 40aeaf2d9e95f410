use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use gatehouse_auth::{AuthzError, PermissionId};
use gatehouse_core::DomainError;
use gatehouse_infra::{AuthError, StoreError};

pub fn auth_error_to_response(err: AuthError) -> axum::response::Response {
    match err {
        AuthError::InvalidCredentials => json_error(
            StatusCode::UNAUTHORIZED,
            "invalid_credentials",
            "invalid email or password",
        ),
        AuthError::Authz(err) => authz_error_to_response(err),
        AuthError::ResetToken(rejection) => json_error(
            StatusCode::BAD_REQUEST,
            rejection.as_str(),
            "reset link is invalid or has expired",
        ),
        AuthError::Validation(err) => domain_error_to_response(err),
        AuthError::Store(err) => store_error_to_response(err),
        AuthError::Internal(msg) => {
            error!(error = %msg, "internal error");
            internal_error()
        }
    }
}

pub fn authz_error_to_response(err: AuthzError) -> axum::response::Response {
    match err {
        AuthzError::Unauthenticated => json_error(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            "authentication required",
        ),
        AuthzError::PermissionDenied { required, missing } => {
            let mut body = json!({
                "error": "forbidden",
                "message": "insufficient permissions",
                "required": ids(&required),
            });
            if let Some(missing) = missing {
                body["missing"] = json!(ids(&missing));
            }
            (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
        }
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(what) => json_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found")),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::Database { operation, message } => {
            error!(operation, error = %message, "store failure");
            internal_error()
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

fn internal_error() -> axum::response::Response {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "internal server error",
    )
}

fn ids(ids: &[PermissionId]) -> Vec<&str> {
    ids.iter().map(PermissionId::as_str).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_infra::ResetTokenRejection;

    #[test]
    fn status_codes() {
        let cases = [
            (AuthError::InvalidCredentials, StatusCode::UNAUTHORIZED),
            (AuthError::unauthenticated(), StatusCode::UNAUTHORIZED),
            (
                AuthError::Authz(AuthzError::denied(vec![PermissionId::from_static("role:read")])),
                StatusCode::FORBIDDEN,
            ),
            (AuthError::ResetToken(ResetTokenRejection::Expired), StatusCode::BAD_REQUEST),
            (
                AuthError::Validation(DomainError::validation("too short")),
                StatusCode::BAD_REQUEST,
            ),
            (AuthError::Store(StoreError::NotFound("role".into())), StatusCode::NOT_FOUND),
            (AuthError::Store(StoreError::Conflict("in use".into())), StatusCode::CONFLICT),
            (
                AuthError::Store(StoreError::database("find_session", "connection refused")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (AuthError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(auth_error_to_response(err).status(), status);
        }
    }
}
