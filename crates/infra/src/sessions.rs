//! Server-side session lifecycle: create, validate, revoke.
//!
//! Expiry is lazy. An expired record stays in the store (and fails
//! validation) until a revoke, a maintenance sweep, or, when configured,
//! the validation that discovers it removes it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use gatehouse_auth::session::DEFAULT_SESSION_TTL_DAYS;
use gatehouse_auth::{Session, SessionOrigin, SessionState, SessionToken};
use gatehouse_core::UserId;

use crate::store::{AuthStore, SessionStore, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub ttl: Duration,
    /// Delete an expired record when validation finds it.
    pub prune_expired_on_validate: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::days(DEFAULT_SESSION_TTL_DAYS),
            prune_expired_on_validate: false,
        }
    }
}

/// Outcome of looking a session token up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Active(Session),
    Expired(Session),
    Missing,
}

impl SessionStatus {
    pub fn active(self) -> Option<Session> {
        match self {
            SessionStatus::Active(session) => Some(session),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn AuthStore>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(store: Arc<dyn AuthStore>, settings: SessionSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    pub async fn create(
        &self,
        user_id: UserId,
        origin: SessionOrigin,
        now: DateTime<Utc>,
    ) -> StoreResult<Session> {
        let session = Session::open(user_id, origin, now, self.settings.ttl);
        self.store.insert_session(session.clone()).await?;
        debug!(user_id = %user_id, session = %session.token.redacted(), "session created");
        Ok(session)
    }

    pub async fn validate(&self, token: &SessionToken, now: DateTime<Utc>) -> StoreResult<SessionStatus> {
        let Some(session) = self.store.find_session(token).await? else {
            return Ok(SessionStatus::Missing);
        };
        match session.state(now) {
            SessionState::Active => Ok(SessionStatus::Active(session)),
            SessionState::Expired => {
                if self.settings.prune_expired_on_validate {
                    self.store.delete_session(token).await?;
                    debug!(session = %token.redacted(), "expired session pruned");
                }
                Ok(SessionStatus::Expired(session))
            }
        }
    }

    /// Delete one session. A record that is already gone is not an error.
    pub async fn revoke(&self, token: &SessionToken) -> StoreResult<bool> {
        let deleted = self.store.delete_session(token).await?;
        if !deleted {
            debug!(session = %token.redacted(), "session already revoked");
        }
        Ok(deleted)
    }

    pub async fn revoke_all(&self, user_id: UserId) -> StoreResult<u64> {
        let revoked = self.store.delete_user_sessions(user_id).await?;
        info!(user_id = %user_id, revoked, "all sessions revoked");
        Ok(revoked)
    }

    pub async fn list_for_user(&self, user_id: UserId) -> StoreResult<Vec<Session>> {
        self.store.list_user_sessions(user_id).await
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let removed = self.store.delete_expired_sessions(now).await?;
        if removed > 0 {
            info!(removed, "expired sessions swept");
        }
        Ok(removed)
    }
}

impl core::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionManager")
            .field("backend", &self.store.backend_name())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryAuthStore;

    fn manager(prune: bool) -> (Arc<InMemoryAuthStore>, SessionManager) {
        let store = Arc::new(InMemoryAuthStore::new());
        let settings = SessionSettings {
            ttl: Duration::hours(1),
            prune_expired_on_validate: prune,
        };
        (store.clone(), SessionManager::new(store, settings))
    }

    #[tokio::test]
    async fn active_then_revoked() {
        let (_, sessions) = manager(false);
        let now = Utc::now();
        let session = sessions.create(UserId::new(), SessionOrigin::default(), now).await.unwrap();
        assert_eq!(session.expires_at, now + Duration::hours(1));

        assert!(matches!(
            sessions.validate(&session.token, now).await.unwrap(),
            SessionStatus::Active(_)
        ));
        assert!(sessions.revoke(&session.token).await.unwrap());
        assert_eq!(
            sessions.validate(&session.token, now).await.unwrap(),
            SessionStatus::Missing
        );
        // Revoking again is tolerated.
        assert!(!sessions.revoke(&session.token).await.unwrap());
    }

    #[tokio::test]
    async fn expiry_is_lazy() {
        let (store, sessions) = manager(false);
        let now = Utc::now();
        let user = UserId::new();
        let session = sessions.create(user, SessionOrigin::default(), now).await.unwrap();

        let later = session.expires_at;
        assert!(matches!(
            sessions.validate(&session.token, later).await.unwrap(),
            SessionStatus::Expired(_)
        ));
        assert_eq!(store.list_user_sessions(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_record_pruned_when_configured() {
        let (store, sessions) = manager(true);
        let now = Utc::now();
        let user = UserId::new();
        let session = sessions.create(user, SessionOrigin::default(), now).await.unwrap();

        let later = now + Duration::hours(2);
        assert!(matches!(
            sessions.validate(&session.token, later).await.unwrap(),
            SessionStatus::Expired(_)
        ));
        assert!(store.list_user_sessions(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn revoke_all_only_touches_owner() {
        let (_, sessions) = manager(false);
        let now = Utc::now();
        let (alice, bob) = (UserId::new(), UserId::new());
        for _ in 0..2 {
            sessions.create(alice, SessionOrigin::default(), now).await.unwrap();
        }
        let bobs = sessions.create(bob, SessionOrigin::default(), now).await.unwrap();

        assert_eq!(sessions.revoke_all(alice).await.unwrap(), 2);
        assert!(sessions.list_for_user(alice).await.unwrap().is_empty());
        assert!(sessions.validate(&bobs.token, now).await.unwrap().active().is_some());
    }

    #[tokio::test]
    async fn origin_metadata_is_kept() {
        let (_, sessions) = manager(false);
        let origin = SessionOrigin {
            ip_address: Some("203.0.113.7".to_string()),
            user_agent: Some("curl/8".to_string()),
        };
        let user = UserId::new();
        sessions.create(user, origin, Utc::now()).await.unwrap();
        let listed = sessions.list_for_user(user).await.unwrap();
        assert_eq!(listed[0].ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(listed[0].user_agent.as_deref(), Some("curl/8"));
    }
}
