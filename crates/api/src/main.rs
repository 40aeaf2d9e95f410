use anyhow::Context;

use gatehouse_api::app::{self, AppState};
use gatehouse_infra::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gatehouse_observability::init();

    let config = Config::from_env().context("load configuration")?;
    if config.insecure_dev_secret {
        tracing::warn!("JWT_SECRET not set; using insecure dev default");
    }
    tracing::debug!(?config, "configuration resolved");

    let auth = app::services::build_auth_service(&config).await?;
    if let Some(every) = config.session_sweep_interval {
        app::services::spawn_session_sweeper(auth.clone(), every);
    }

    let app = app::build_app(AppState::new(auth).with_secure_cookies(config.cookie_secure));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
