use gatehouse_core::UserId;

use crate::{PermissionId, SessionToken, TokenClaims};

/// An identity whose signed token verified and whose session record is live.
///
/// Construction is left to the orchestrator; this type only carries the
/// result. `claims.permissions` is the login-time snapshot, not a fresh
/// authorization source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub session_token: SessionToken,
    pub claims: TokenClaims,
}

impl Principal {
    pub fn from_claims(claims: TokenClaims) -> Self {
        Self {
            user_id: claims.id,
            session_token: claims.session_token.clone(),
            claims,
        }
    }

    /// Permission snapshot from the token (UX only).
    pub fn snapshot_permissions(&self) -> &[PermissionId] {
        &self.claims.permissions
    }
}
