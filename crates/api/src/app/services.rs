//! Service wiring: store selection, catalog seeding and the session sweeper.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use gatehouse_auth::Hs256TokenCodec;
use gatehouse_infra::seed;
use gatehouse_infra::{AuthService, AuthStore, Config, InMemoryAuthStore, PostgresAuthStore};

/// Build the auth service described by `config`.
///
/// Postgres when `DATABASE_URL` is set, otherwise an in-memory store whose
/// contents live as long as the process. The permission catalog is seeded
/// and the bootstrap administrator created before the service is returned.
pub async fn build_auth_service(config: &Config) -> anyhow::Result<Arc<AuthService>> {
    let store: Arc<dyn AuthStore> = match &config.database_url {
        Some(url) => Arc::new(
            PostgresAuthStore::connect(url)
                .await
                .context("connect to postgres")?,
        ),
        None => Arc::new(InMemoryAuthStore::new()),
    };
    info!(store = store.backend_name(), "auth store ready");

    seed::seed_catalog(store.as_ref())
        .await
        .context("seed permission catalog")?;
    seed::ensure_admin_role(store.as_ref())
        .await
        .context("ensure admin role")?;

    let auth = Arc::new(AuthService::new(
        store,
        Arc::new(Hs256TokenCodec::new(config.jwt_secret.as_bytes())),
        config.notifier.build(),
        config.auth_settings(),
    ));

    if let Some(admin) = &config.bootstrap_admin {
        let user = seed::bootstrap_admin(&auth, admin)
            .await
            .context("bootstrap administrator")?;
        info!(user_id = %user.id, "bootstrap administrator ready");
    }

    Ok(auth)
}

/// Periodically delete expired sessions. Validation already refuses them;
/// this only reclaims space.
pub fn spawn_session_sweeper(auth: Arc<AuthService>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = auth.sessions().sweep_expired(Utc::now()).await {
                error!(error = %err, "session sweep failed");
            }
        }
    })
}
