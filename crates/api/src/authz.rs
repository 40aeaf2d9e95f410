//! API-side authorization guard.
//!
//! Every check goes back to the store through `AuthService::authorize`; the
//! permission snapshot carried in the token is never consulted here.

use std::future::Future;
use std::sync::Arc;

use gatehouse_auth::{AuthzError, PermissionId, Requirement};
use gatehouse_core::UserId;
use gatehouse_infra::{AuthResult, AuthService, StoreError};

use crate::context::RequestIdentity;
use crate::middleware::RequireLayer;

#[derive(Clone)]
pub struct Guard {
    auth: Arc<AuthService>,
}

impl Guard {
    pub fn new(auth: Arc<AuthService>) -> Self {
        Self { auth }
    }

    pub fn require_auth(&self, identity: &RequestIdentity) -> Result<UserId, AuthzError> {
        identity.user_id().ok_or(AuthzError::Unauthenticated)
    }

    pub async fn require_permission(
        &self,
        identity: &RequestIdentity,
        permission: &PermissionId,
    ) -> AuthResult<UserId> {
        self.check(identity, &Requirement::one(permission.clone())).await
    }

    /// Denied for an empty list.
    pub async fn require_any_permission(
        &self,
        identity: &RequestIdentity,
        permissions: &[PermissionId],
    ) -> AuthResult<UserId> {
        self.check(identity, &Requirement::any(permissions.iter().cloned()))
            .await
    }

    /// Granted for an empty list. A denial lists the missing ids in request order.
    pub async fn require_all_permissions(
        &self,
        identity: &RequestIdentity,
        permissions: &[PermissionId],
    ) -> AuthResult<UserId> {
        self.check(identity, &Requirement::all(permissions.iter().cloned()))
            .await
    }

    pub async fn check(
        &self,
        identity: &RequestIdentity,
        requirement: &Requirement,
    ) -> AuthResult<UserId> {
        if identity.is_unresolved() {
            return Err(StoreError::database("authenticate", "credential could not be checked").into());
        }
        let user_id = self.require_auth(identity)?;
        self.auth.authorize(user_id, requirement).await?;
        Ok(user_id)
    }

    /// Run `op` only if `identity` satisfies `requirement`.
    pub async fn protect<T, F, Fut>(
        &self,
        identity: &RequestIdentity,
        requirement: &Requirement,
        op: F,
    ) -> AuthResult<T>
    where
        F: FnOnce(UserId) -> Fut,
        Fut: Future<Output = AuthResult<T>>,
    {
        let user_id = self.check(identity, requirement).await?;
        op(user_id).await
    }

    /// Route layer enforcing `requirement`.
    pub fn layer(&self, requirement: Requirement) -> RequireLayer {
        crate::middleware::require(self, requirement)
    }
}

impl core::fmt::Debug for Guard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Guard").finish_non_exhaustive()
    }
}
