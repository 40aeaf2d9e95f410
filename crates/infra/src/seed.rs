//! System permission catalog and first-run administrator.

use chrono::Utc;
use tracing::info;

use gatehouse_auth::{NewRole, NewUser, Permission, PermissionId, Role, User, normalize_email};

use crate::auth_service::{AuthResult, AuthService};
use crate::config::BootstrapAdmin;
use crate::store::{AuthStore, RbacStore, StoreError, StoreResult, UserStore};

pub const ADMIN_ROLE: &str = "admin";

pub mod ids {
    use gatehouse_auth::PermissionId;

    pub const USER_CREATE: PermissionId = PermissionId::from_static("user:create");
    pub const USER_READ: PermissionId = PermissionId::from_static("user:read");
    pub const USER_UPDATE: PermissionId = PermissionId::from_static("user:update");
    pub const USER_DELETE: PermissionId = PermissionId::from_static("user:delete");
    pub const ROLE_CREATE: PermissionId = PermissionId::from_static("role:create");
    pub const ROLE_READ: PermissionId = PermissionId::from_static("role:read");
    pub const ROLE_UPDATE: PermissionId = PermissionId::from_static("role:update");
    pub const ROLE_DELETE: PermissionId = PermissionId::from_static("role:delete");
    pub const PERMISSION_READ: PermissionId = PermissionId::from_static("permission:read");
    pub const SESSION_REVOKE: PermissionId = PermissionId::from_static("session:revoke");
    pub const MENU_CREATE: PermissionId = PermissionId::from_static("menu:create");
    pub const MENU_READ: PermissionId = PermissionId::from_static("menu:read");
    pub const MENU_UPDATE: PermissionId = PermissionId::from_static("menu:update");
    pub const MENU_DELETE: PermissionId = PermissionId::from_static("menu:delete");
    pub const AUDIT_READ: PermissionId = PermissionId::from_static("audit:read");
}

/// The permission catalog every deployment starts with.
///
/// Ids are a cross-version contract: renaming one is a breaking migration.
pub fn default_permissions() -> Vec<Permission> {
    [
        (ids::USER_CREATE, "Create users"),
        (ids::USER_READ, "View users"),
        (ids::USER_UPDATE, "Edit users and their role assignments"),
        (ids::USER_DELETE, "Delete users"),
        (ids::ROLE_CREATE, "Create roles"),
        (ids::ROLE_READ, "View roles"),
        (ids::ROLE_UPDATE, "Edit roles and their permissions"),
        (ids::ROLE_DELETE, "Delete roles"),
        (ids::PERMISSION_READ, "View the permission catalog"),
        (ids::SESSION_REVOKE, "Revoke other users' sessions"),
        (ids::MENU_CREATE, "Create menu entries"),
        (ids::MENU_READ, "View menu entries"),
        (ids::MENU_UPDATE, "Edit menu entries"),
        (ids::MENU_DELETE, "Delete menu entries"),
        (ids::AUDIT_READ, "View the audit log"),
    ]
    .into_iter()
    .map(|(id, description)| Permission::new(id, description))
    .collect()
}

/// Upsert the default catalog. Idempotent.
pub async fn seed_catalog(store: &dyn AuthStore) -> StoreResult<usize> {
    let catalog = default_permissions();
    let count = catalog.len();
    for permission in catalog {
        store.upsert_permission(permission).await?;
    }
    info!(count, "permission catalog seeded");
    Ok(count)
}

/// Ensure the `admin` role exists and holds every catalog permission.
pub async fn ensure_admin_role(store: &dyn AuthStore) -> StoreResult<Role> {
    let role = match store.find_role_by_name(ADMIN_ROLE).await? {
        Some(role) => role,
        None => match store
            .create_role(
                NewRole::new(ADMIN_ROLE).with_description("Full administrative access"),
                Utc::now(),
            )
            .await
        {
            Ok(role) => role,
            // Another instance created it first.
            Err(StoreError::Conflict(_)) => store
                .find_role_by_name(ADMIN_ROLE)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("role {ADMIN_ROLE}")))?,
            Err(err) => return Err(err),
        },
    };

    let granted: Vec<PermissionId> = store
        .list_permissions()
        .await?
        .into_iter()
        .map(|p| p.id)
        .collect();
    for id in &granted {
        store.grant_permission(role.id, id).await?;
    }
    Ok(role)
}

/// Create the configured administrator if no user has that email yet, and
/// make sure it holds the `admin` role.
pub async fn bootstrap_admin(auth: &AuthService, admin: &BootstrapAdmin) -> AuthResult<User> {
    let store = auth.store().as_ref();
    let role = ensure_admin_role(store).await?;

    let user = match store.find_user_by_email(&normalize_email(&admin.email)).await? {
        Some(user) => user,
        None => {
            let user = auth
                .register_user(
                    NewUser::new(admin.email.clone(), "Administrator"),
                    &admin.password,
                    Utc::now(),
                )
                .await?;
            info!(user_id = %user.id, "bootstrap administrator created");
            user
        }
    };

    store
        .assign_role(user.id, role.id, None, Utc::now())
        .await?;
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use crate::auth_service::AuthSettings;
    use crate::notify::LogNotifier;
    use crate::store::InMemoryAuthStore;
    use gatehouse_auth::{Hs256TokenCodec, SessionOrigin};

    #[test]
    fn catalog_ids_are_unique_and_well_formed() {
        let catalog = default_permissions();
        let ids: HashSet<&str> = catalog.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids.len(), catalog.len());
        for permission in &catalog {
            assert_eq!(PermissionId::parse(permission.id.as_str().to_string()).unwrap(), permission.id);
            assert_eq!(permission.module, permission.id.module());
        }
    }

    #[tokio::test]
    async fn seeding_twice_is_harmless() {
        let store = InMemoryAuthStore::new();
        let n = seed_catalog(&store).await.unwrap();
        seed_catalog(&store).await.unwrap();
        assert_eq!(store.list_permissions().await.unwrap().len(), n);

        let first = ensure_admin_role(&store).await.unwrap();
        let second = ensure_admin_role(&store).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.role_permissions(first.id).await.unwrap().len(), n);
    }

    #[tokio::test]
    async fn bootstrap_admin_can_log_in_with_full_catalog() {
        let store = Arc::new(InMemoryAuthStore::new());
        seed_catalog(store.as_ref()).await.unwrap();
        let auth = AuthService::new(
            store.clone(),
            Arc::new(Hs256TokenCodec::new(b"secret")),
            Arc::new(LogNotifier),
            AuthSettings {
                bcrypt_cost: 4,
                ..AuthSettings::default()
            },
        );
        let admin = BootstrapAdmin {
            email: "root@example.com".to_string(),
            password: "bootstrap-password".to_string(),
        };

        let user = bootstrap_admin(&auth, &admin).await.unwrap();
        let again = bootstrap_admin(&auth, &admin).await.unwrap();
        assert_eq!(user.id, again.id);

        let outcome = auth
            .login("root@example.com", "bootstrap-password", SessionOrigin::default(), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.claims.permissions.len(), default_permissions().len());
    }
}
