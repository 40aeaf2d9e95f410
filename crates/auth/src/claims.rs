use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use gatehouse_core::UserId;

use crate::{PermissionId, SessionToken, User};

/// Claims carried by the signed token.
///
/// `permissions` is a denormalized snapshot taken at login. It may be stale
/// and is only trusted for UX decisions; `session_token` names the server-side
/// session record that actually decides whether the token is still live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub first_name: String,
    pub last_name: String,
    pub email_verified: bool,
    pub permissions: Vec<PermissionId>,
    pub session_token: SessionToken,

    /// Issued-at (seconds since epoch).
    pub iat: i64,

    /// Expiration (seconds since epoch).
    pub exp: i64,
}

impl TokenClaims {
    pub fn for_session(
        user: &User,
        permissions: Vec<PermissionId>,
        session_token: SessionToken,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            email_verified: user.email_verified(),
            permissions,
            session_token,
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        }
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.iat, 0).single()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (issued_at is in the future)")]
    NotYetValid,

    #[error("invalid token time window (exp <= iat)")]
    InvalidTimeWindow,
}

/// Clock skew tolerated between the node that issued a token and the one
/// validating it.
pub const ISSUED_AT_LEEWAY_SECONDS: i64 = 30;

/// Deterministically validate the time window of decoded claims.
///
/// Signature verification happens in the codec; this only looks at `iat`/`exp`
/// against the caller-supplied `now`. `iat` may be up to
/// [`ISSUED_AT_LEEWAY_SECONDS`] ahead of `now`.
pub fn validate_claims(claims: &TokenClaims, now: DateTime<Utc>) -> Result<(), TokenValidationError> {
    if claims.exp <= claims.iat {
        return Err(TokenValidationError::InvalidTimeWindow);
    }
    let now = now.timestamp();
    if now + ISSUED_AT_LEEWAY_SECONDS < claims.iat {
        return Err(TokenValidationError::NotYetValid);
    }
    if now >= claims.exp {
        return Err(TokenValidationError::Expired);
    }
    Ok(())
}
