//! In-memory store for tests/dev.
//!
//! A single `RwLock` over all tables stands in for the relational store: each
//! trait method takes the lock once, so every method is its own transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use gatehouse_auth::{
    Credential, NewRole, PasswordHash, PasswordResetToken, Permission, PermissionId, ResetTokenHash,
    Role, RoleAssignment, Session, SessionToken, User,
};
use gatehouse_core::{RoleId, UserId};

use super::{
    AuthStore, RbacStore, ResetTokenStore, SessionStore, StoreError, StoreResult, UserStore,
};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    emails: HashMap<String, UserId>,
    credentials: HashMap<UserId, PasswordHash>,
    permissions: BTreeMap<PermissionId, Permission>,
    roles: HashMap<RoleId, Role>,
    role_permissions: BTreeSet<(RoleId, PermissionId)>,
    user_roles: BTreeMap<(UserId, RoleId), RoleAssignment>,
    sessions: HashMap<SessionToken, Session>,
    reset_tokens: HashMap<ResetTokenHash, PasswordResetToken>,
}

impl Tables {
    fn user_role_ids(&self, user_id: UserId) -> Vec<RoleId> {
        self.user_roles
            .keys()
            .filter(|(u, _)| *u == user_id)
            .map(|(_, r)| *r)
            .collect()
    }

    fn effective(&self, user_id: UserId) -> BTreeSet<PermissionId> {
        let roles = self.user_role_ids(user_id);
        self.role_permissions
            .iter()
            .filter(|(role, perm)| roles.contains(role) && self.permissions.contains_key(perm))
            .map(|(_, perm)| perm.clone())
            .collect()
    }

    fn delete_sessions_of(&mut self, user_id: UserId) -> u64 {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.user_id != user_id);
        (before - self.sessions.len()) as u64
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAuthStore {
    tables: RwLock<Tables>,
    rbac_reads: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of permission queries served so far.
    pub fn rbac_reads(&self) -> u64 {
        self.rbac_reads.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail with a database error (outage simulation).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self, operation: &'static str) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::database(operation, "store unavailable"));
        }
        Ok(())
    }

    fn read(&self, operation: &'static str) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.check_available(operation)?;
        self.tables
            .read()
            .map_err(|_| StoreError::database(operation, "lock poisoned"))
    }

    fn write(&self, operation: &'static str) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.check_available(operation)?;
        self.tables
            .write()
            .map_err(|_| StoreError::database(operation, "lock poisoned"))
    }

    fn rbac_read(&self, operation: &'static str) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        let tables = self.read(operation)?;
        self.rbac_reads.fetch_add(1, Ordering::SeqCst);
        Ok(tables)
    }
}

#[async_trait]
impl UserStore for InMemoryAuthStore {
    async fn create_user(&self, user: User, password_hash: PasswordHash) -> StoreResult<User> {
        let mut t = self.write("create_user")?;
        if t.emails.contains_key(&user.email) {
            return Err(StoreError::Conflict(format!("email '{}' already registered", user.email)));
        }
        t.emails.insert(user.email.clone(), user.id);
        t.credentials.insert(user.id, password_hash);
        t.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: UserId) -> StoreResult<Option<User>> {
        Ok(self.read("get_user")?.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let t = self.read("find_user_by_email")?;
        Ok(t.emails.get(email).and_then(|id| t.users.get(id)).cloned())
    }

    async fn credential(&self, user_id: UserId) -> StoreResult<Option<Credential>> {
        let t = self.read("credential")?;
        Ok(t.credentials.get(&user_id).map(|hash| Credential {
            user_id,
            password_hash: hash.clone(),
        }))
    }

    async fn rotate_credential(
        &self,
        user_id: UserId,
        password_hash: PasswordHash,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut t = self.write("rotate_credential")?;
        let Some(user) = t.users.get_mut(&user_id) else {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        };
        user.updated_at = now;
        t.credentials.insert(user_id, password_hash);
        Ok(t.delete_sessions_of(user_id))
    }
}

#[async_trait]
impl RbacStore for InMemoryAuthStore {
    async fn upsert_permission(&self, permission: Permission) -> StoreResult<()> {
        let mut t = self.write("upsert_permission")?;
        t.permissions.insert(permission.id.clone(), permission);
        Ok(())
    }

    async fn list_permissions(&self) -> StoreResult<Vec<Permission>> {
        Ok(self.read("list_permissions")?.permissions.values().cloned().collect())
    }

    async fn create_role(&self, role: NewRole, now: DateTime<Utc>) -> StoreResult<Role> {
        let mut t = self.write("create_role")?;
        if t.roles.values().any(|r| r.name == role.name) {
            return Err(StoreError::Conflict(format!("role '{}' already exists", role.name)));
        }
        let role = role.into_role(now);
        t.roles.insert(role.id, role.clone());
        Ok(role)
    }

    async fn get_role(&self, role_id: RoleId) -> StoreResult<Option<Role>> {
        Ok(self.read("get_role")?.roles.get(&role_id).cloned())
    }

    async fn find_role_by_name(&self, name: &str) -> StoreResult<Option<Role>> {
        let t = self.read("find_role_by_name")?;
        Ok(t.roles.values().find(|r| r.name == name).cloned())
    }

    async fn list_roles(&self) -> StoreResult<Vec<Role>> {
        let t = self.read("list_roles")?;
        let mut roles: Vec<Role> = t.roles.values().cloned().collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn delete_role(&self, role_id: RoleId) -> StoreResult<()> {
        let mut t = self.write("delete_role")?;
        if !t.roles.contains_key(&role_id) {
            return Err(StoreError::NotFound(format!("role {role_id}")));
        }
        let holders = t.user_roles.keys().filter(|(_, r)| *r == role_id).count();
        if holders > 0 {
            return Err(StoreError::Conflict(format!(
                "role is assigned to {holders} user(s)"
            )));
        }
        t.role_permissions.retain(|(r, _)| *r != role_id);
        t.roles.remove(&role_id);
        Ok(())
    }

    async fn grant_permission(&self, role_id: RoleId, permission: &PermissionId) -> StoreResult<bool> {
        let mut t = self.write("grant_permission")?;
        if !t.roles.contains_key(&role_id) {
            return Err(StoreError::NotFound(format!("role {role_id}")));
        }
        if !t.permissions.contains_key(permission) {
            return Err(StoreError::NotFound(format!("permission {permission}")));
        }
        Ok(t.role_permissions.insert((role_id, permission.clone())))
    }

    async fn revoke_permission(&self, role_id: RoleId, permission: &PermissionId) -> StoreResult<bool> {
        let mut t = self.write("revoke_permission")?;
        Ok(t.role_permissions.remove(&(role_id, permission.clone())))
    }

    async fn role_permissions(&self, role_id: RoleId) -> StoreResult<Vec<PermissionId>> {
        let t = self.read("role_permissions")?;
        Ok(t.role_permissions
            .iter()
            .filter(|(r, _)| *r == role_id)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn assign_role(
        &self,
        user_id: UserId,
        role_id: RoleId,
        assigned_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut t = self.write("assign_role")?;
        if !t.users.contains_key(&user_id) {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        if !t.roles.contains_key(&role_id) {
            return Err(StoreError::NotFound(format!("role {role_id}")));
        }
        if t.user_roles.contains_key(&(user_id, role_id)) {
            return Ok(false);
        }
        t.user_roles.insert(
            (user_id, role_id),
            RoleAssignment {
                user_id,
                role_id,
                assigned_by,
                assigned_at: now,
            },
        );
        Ok(true)
    }

    async fn remove_role(&self, user_id: UserId, role_id: RoleId) -> StoreResult<bool> {
        let mut t = self.write("remove_role")?;
        Ok(t.user_roles.remove(&(user_id, role_id)).is_some())
    }

    async fn role_assignments(&self, user_id: UserId) -> StoreResult<Vec<RoleAssignment>> {
        let t = self.read("role_assignments")?;
        Ok(t.user_roles
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn effective_permissions(&self, user_id: UserId) -> StoreResult<Vec<PermissionId>> {
        let t = self.rbac_read("effective_permissions")?;
        Ok(t.effective(user_id).into_iter().collect())
    }

    async fn has_permission(&self, user_id: UserId, permission: &PermissionId) -> StoreResult<bool> {
        let t = self.rbac_read("has_permission")?;
        Ok(t.effective(user_id).contains(permission))
    }

    async fn has_any_permission(
        &self,
        user_id: UserId,
        permissions: &[PermissionId],
    ) -> StoreResult<bool> {
        let t = self.rbac_read("has_any_permission")?;
        let effective = t.effective(user_id);
        Ok(permissions.iter().any(|p| effective.contains(p)))
    }

    async fn held_permissions(
        &self,
        user_id: UserId,
        permissions: &[PermissionId],
    ) -> StoreResult<Vec<PermissionId>> {
        let t = self.rbac_read("held_permissions")?;
        let effective = t.effective(user_id);
        let held: BTreeSet<PermissionId> = permissions
            .iter()
            .filter(|p| effective.contains(*p))
            .cloned()
            .collect();
        Ok(held.into_iter().collect())
    }
}

#[async_trait]
impl SessionStore for InMemoryAuthStore {
    async fn insert_session(&self, session: Session) -> StoreResult<()> {
        let mut t = self.write("insert_session")?;
        if t.sessions.contains_key(&session.token) {
            return Err(StoreError::Conflict("session token collision".to_string()));
        }
        t.sessions.insert(session.token.clone(), session);
        Ok(())
    }

    async fn find_session(&self, token: &SessionToken) -> StoreResult<Option<Session>> {
        Ok(self.read("find_session")?.sessions.get(token).cloned())
    }

    async fn delete_session(&self, token: &SessionToken) -> StoreResult<bool> {
        Ok(self.write("delete_session")?.sessions.remove(token).is_some())
    }

    async fn delete_user_sessions(&self, user_id: UserId) -> StoreResult<u64> {
        Ok(self.write("delete_user_sessions")?.delete_sessions_of(user_id))
    }

    async fn list_user_sessions(&self, user_id: UserId) -> StoreResult<Vec<Session>> {
        let t = self.read("list_user_sessions")?;
        let mut sessions: Vec<Session> = t
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut t = self.write("delete_expired_sessions")?;
        let before = t.sessions.len();
        t.sessions.retain(|_, s| s.is_active(now));
        Ok((before - t.sessions.len()) as u64)
    }
}

#[async_trait]
impl ResetTokenStore for InMemoryAuthStore {
    async fn replace_reset_token(&self, token: PasswordResetToken) -> StoreResult<()> {
        let mut t = self.write("replace_reset_token")?;
        t.reset_tokens.retain(|_, r| r.user_id != token.user_id);
        t.reset_tokens.insert(token.token_hash.clone(), token);
        Ok(())
    }

    async fn find_reset_token(&self, hash: &ResetTokenHash) -> StoreResult<Option<PasswordResetToken>> {
        Ok(self.read("find_reset_token")?.reset_tokens.get(hash).cloned())
    }

    async fn delete_reset_token(&self, hash: &ResetTokenHash) -> StoreResult<bool> {
        Ok(self.write("delete_reset_token")?.reset_tokens.remove(hash).is_some())
    }

    async fn complete_password_reset(
        &self,
        hash: &ResetTokenHash,
        password_hash: PasswordHash,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut t = self.write("complete_password_reset")?;
        let Some(token) = t.reset_tokens.get(hash).cloned() else {
            return Err(StoreError::NotFound("reset token".to_string()));
        };
        let user_id = token.user_id;
        let Some(user) = t.users.get_mut(&user_id) else {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        };
        user.updated_at = now;
        t.credentials.insert(user_id, password_hash);
        t.reset_tokens.retain(|_, r| r.user_id != user_id);
        Ok(t.delete_sessions_of(user_id))
    }
}

#[async_trait]
impl AuthStore for InMemoryAuthStore {
    async fn health_check(&self) -> StoreResult<()> {
        self.read("health_check").map(|_| ())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use gatehouse_auth::{NewUser, SessionOrigin};

    fn p(s: &'static str) -> PermissionId {
        PermissionId::from_static(s)
    }

    async fn user(store: &InMemoryAuthStore, email: &str) -> User {
        let u = NewUser::new(email, "Someone").normalized().unwrap().into_user(Utc::now());
        store
            .create_user(u, PasswordHash::from_stored("$2b$04$placeholder"))
            .await
            .unwrap()
    }

    async fn role_with(store: &InMemoryAuthStore, name: &str, perms: &[&'static str]) -> Role {
        let role = store.create_role(NewRole::new(name), Utc::now()).await.unwrap();
        for perm in perms {
            store
                .upsert_permission(Permission::new(p(perm), *perm))
                .await
                .unwrap();
            store.grant_permission(role.id, &p(perm)).await.unwrap();
        }
        role
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let store = InMemoryAuthStore::new();
        user(&store, "a@example.com").await;
        let again = NewUser::new("a@example.com", "Again").into_user(Utc::now());
        let err = store
            .create_user(again, PasswordHash::from_stored("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn assigning_twice_keeps_one_row() {
        let store = InMemoryAuthStore::new();
        let u = user(&store, "a@example.com").await;
        let role = role_with(&store, "editor", &["content:edit"]).await;

        assert!(store.assign_role(u.id, role.id, None, Utc::now()).await.unwrap());
        assert!(!store.assign_role(u.id, role.id, None, Utc::now()).await.unwrap());
        assert_eq!(store.role_assignments(u.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_role_blocked_while_assigned() {
        let store = InMemoryAuthStore::new();
        let u = user(&store, "a@example.com").await;
        let role = role_with(&store, "editor", &["content:edit"]).await;
        store.assign_role(u.id, role.id, None, Utc::now()).await.unwrap();

        assert!(matches!(
            store.delete_role(role.id).await.unwrap_err(),
            StoreError::Conflict(_)
        ));

        store.remove_role(u.id, role.id).await.unwrap();
        store.delete_role(role.id).await.unwrap();
        assert!(store.get_role(role.id).await.unwrap().is_none());
        assert!(store.role_permissions(role.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn grant_requires_catalog_permission() {
        let store = InMemoryAuthStore::new();
        let role = store.create_role(NewRole::new("r"), Utc::now()).await.unwrap();
        let err = store.grant_permission(role.id, &p("ghost:perm")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn password_reset_completion_is_all_or_nothing() {
        let store = InMemoryAuthStore::new();
        let u = user(&store, "a@example.com").await;
        let now = Utc::now();
        for _ in 0..2 {
            store
                .insert_session(Session::open(u.id, SessionOrigin::default(), now, Duration::days(30)))
                .await
                .unwrap();
        }
        let (token, _raw) = PasswordResetToken::issue(u.id, now, Duration::minutes(30));
        store.replace_reset_token(token.clone()).await.unwrap();

        let revoked = store
            .complete_password_reset(&token.token_hash, PasswordHash::from_stored("new"), now)
            .await
            .unwrap();
        assert_eq!(revoked, 2);
        assert!(store.list_user_sessions(u.id).await.unwrap().is_empty());
        assert!(store.find_reset_token(&token.token_hash).await.unwrap().is_none());
        assert_eq!(
            store.credential(u.id).await.unwrap().unwrap().password_hash.as_str(),
            "new"
        );

        // Second use finds nothing and changes nothing.
        let err = store
            .complete_password_reset(&token.token_hash, PasswordHash::from_stored("newer"), now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(
            store.credential(u.id).await.unwrap().unwrap().password_hash.as_str(),
            "new"
        );
    }

    #[tokio::test]
    async fn reissuing_reset_token_replaces_previous() {
        let store = InMemoryAuthStore::new();
        let u = user(&store, "a@example.com").await;
        let now = Utc::now();
        let (first, _) = PasswordResetToken::issue(u.id, now, Duration::minutes(30));
        let (second, _) = PasswordResetToken::issue(u.id, now, Duration::minutes(30));
        store.replace_reset_token(first.clone()).await.unwrap();
        store.replace_reset_token(second.clone()).await.unwrap();
        assert!(store.find_reset_token(&first.token_hash).await.unwrap().is_none());
        assert!(store.find_reset_token(&second.token_hash).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_sessions() {
        let store = InMemoryAuthStore::new();
        let u = user(&store, "a@example.com").await;
        let now = Utc::now();
        store
            .insert_session(Session::open(u.id, SessionOrigin::default(), now, Duration::seconds(1)))
            .await
            .unwrap();
        store
            .insert_session(Session::open(u.id, SessionOrigin::default(), now, Duration::days(1)))
            .await
            .unwrap();

        let removed = store
            .delete_expired_sessions(now + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_user_sessions(u.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn outage_surfaces_as_database_error() {
        let store = InMemoryAuthStore::new();
        store.set_unavailable(true);
        let err = store.has_permission(UserId::new(), &p("user:read")).await.unwrap_err();
        assert!(matches!(err, StoreError::Database { .. }));
    }
}
