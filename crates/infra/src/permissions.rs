//! Server-trusted permission queries.
//!
//! Every call is a fresh store query; nothing here is cached. Empty
//! requirement lists are answered without touching the store:
//! "any of nothing" is never satisfied, "all of nothing" always is.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::debug;

use gatehouse_auth::{PermissionCheck, PermissionId};
use gatehouse_auth::evaluate::missing_in_request_order;
use gatehouse_core::UserId;

use crate::store::{AuthStore, RbacStore, StoreResult};

#[derive(Clone)]
pub struct PermissionQuery {
    store: Arc<dyn AuthStore>,
}

impl PermissionQuery {
    pub fn new(store: Arc<dyn AuthStore>) -> Self {
        Self { store }
    }

    /// De-duplicated permissions reachable through the user's roles.
    ///
    /// Empty for a user without roles and for an unknown user alike; callers
    /// that care about the difference must check user existence themselves.
    pub async fn effective_permissions(&self, user_id: UserId) -> StoreResult<BTreeSet<PermissionId>> {
        let ids = self.store.effective_permissions(user_id).await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn has_permission(&self, user_id: UserId, permission: &PermissionId) -> StoreResult<bool> {
        self.store.has_permission(user_id, permission).await
    }

    pub async fn has_any_permission(
        &self,
        user_id: UserId,
        permissions: &[PermissionId],
    ) -> StoreResult<bool> {
        if permissions.is_empty() {
            debug!(user_id = %user_id, "any-of check with no permissions denied");
            return Ok(false);
        }
        self.store.has_any_permission(user_id, permissions).await
    }

    /// `missing_permissions` lists the absent ids in request order.
    pub async fn has_all_permissions(
        &self,
        user_id: UserId,
        permissions: &[PermissionId],
    ) -> StoreResult<PermissionCheck> {
        if permissions.is_empty() {
            return Ok(PermissionCheck::granted());
        }
        let held: HashSet<PermissionId> = self
            .store
            .held_permissions(user_id, permissions)
            .await?
            .into_iter()
            .collect();
        let missing = missing_in_request_order(permissions, |id| held.contains(id));
        Ok(PermissionCheck::from_missing(missing))
    }
}

impl core::fmt::Debug for PermissionQuery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PermissionQuery")
            .field("backend", &self.store.backend_name())
            .finish()
    }
}
