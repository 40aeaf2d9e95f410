use std::net::SocketAddr;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, bail};
use chrono::Duration;

use gatehouse_auth::password::DEFAULT_COST_FACTOR;
use gatehouse_auth::reset::DEFAULT_RESET_TTL_MINUTES;
use gatehouse_auth::session::DEFAULT_SESSION_TTL_DAYS;

use crate::auth_service::AuthSettings;
use crate::notify::NotifierConfig;
use crate::sessions::SessionSettings;

const DEV_JWT_SECRET: &str = "gatehouse-dev-secret-change-me";

/// No `Debug`: holds a plaintext password.
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapAdmin {
    pub email: String,
    pub password: String,
}

// Service configuration sourced from environment variables, resolved once at startup.
#[derive(Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    /// Set when `JWT_SECRET` was absent and dev mode supplied a fallback.
    pub insecure_dev_secret: bool,
    pub database_url: Option<String>,
    pub session_ttl: Duration,
    pub reset_token_ttl: Duration,
    pub bcrypt_cost: u32,
    pub reset_link_base: String,
    pub notifier: NotifierConfig,
    pub bootstrap_admin: Option<BootstrapAdmin>,
    pub session_sweep_interval: Option<StdDuration>,
    pub prune_expired_on_validate: bool,
    /// Mark the session cookie `Secure`.
    pub cookie_secure: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr = var("GATEHOUSE_BIND")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse GATEHOUSE_BIND")?;

        let dev_mode = parse_bool(var("GATEHOUSE_DEV").as_deref(), "GATEHOUSE_DEV")?.unwrap_or(false);
        let (jwt_secret, insecure_dev_secret) = match var("JWT_SECRET") {
            Some(secret) => (secret, false),
            None if dev_mode => (DEV_JWT_SECRET.to_string(), true),
            None => bail!("JWT_SECRET is required (set GATEHOUSE_DEV=true to use an insecure default)"),
        };

        let session_ttl_days = parse_num(var("SESSION_TTL_DAYS"), "SESSION_TTL_DAYS")?
            .unwrap_or(DEFAULT_SESSION_TTL_DAYS);
        if session_ttl_days <= 0 {
            bail!("SESSION_TTL_DAYS must be positive");
        }
        let reset_ttl_minutes = parse_num(var("RESET_TOKEN_TTL_MINUTES"), "RESET_TOKEN_TTL_MINUTES")?
            .unwrap_or(DEFAULT_RESET_TTL_MINUTES);
        if reset_ttl_minutes <= 0 {
            bail!("RESET_TOKEN_TTL_MINUTES must be positive");
        }
        let bcrypt_cost = parse_num(var("BCRYPT_COST"), "BCRYPT_COST")?
            .unwrap_or(DEFAULT_COST_FACTOR as i64);
        if !(4..=31).contains(&bcrypt_cost) {
            bail!("BCRYPT_COST must be between 4 and 31");
        }

        let notifier = NotifierConfig::resolve(
            var("NOTIFIER").as_deref(),
            var("NOTIFIER_WEBHOOK_URL").as_deref(),
        )?;

        let bootstrap_admin = match (var("BOOTSTRAP_ADMIN_EMAIL"), var("BOOTSTRAP_ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(BootstrapAdmin { email, password }),
            (None, None) => None,
            _ => bail!("BOOTSTRAP_ADMIN_EMAIL and BOOTSTRAP_ADMIN_PASSWORD must be set together"),
        };

        let session_sweep_interval = parse_num(var("SESSION_SWEEP_INTERVAL_SECS"), "SESSION_SWEEP_INTERVAL_SECS")?
            .filter(|secs| *secs > 0)
            .map(|secs| StdDuration::from_secs(secs as u64));

        let prune_expired_on_validate =
            parse_bool(var("PRUNE_EXPIRED_ON_VALIDATE").as_deref(), "PRUNE_EXPIRED_ON_VALIDATE")?
                .unwrap_or(false);
        let cookie_secure =
            parse_bool(var("COOKIE_SECURE").as_deref(), "COOKIE_SECURE")?.unwrap_or(!dev_mode);

        Ok(Self {
            bind_addr,
            jwt_secret,
            insecure_dev_secret,
            database_url: var("DATABASE_URL"),
            session_ttl: Duration::days(session_ttl_days),
            reset_token_ttl: Duration::minutes(reset_ttl_minutes),
            bcrypt_cost: bcrypt_cost as u32,
            reset_link_base: var("RESET_LINK_BASE")
                .unwrap_or_else(|| AuthSettings::default().reset_link_base),
            notifier,
            bootstrap_admin,
            session_sweep_interval,
            prune_expired_on_validate,
            cookie_secure,
        })
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings {
            session: SessionSettings {
                ttl: self.session_ttl,
                prune_expired_on_validate: self.prune_expired_on_validate,
            },
            reset_token_ttl: self.reset_token_ttl,
            reset_link_base: self.reset_link_base.clone(),
            bcrypt_cost: self.bcrypt_cost,
        }
    }
}

impl core::fmt::Debug for Config {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Config")
            .field("bind_addr", &self.bind_addr)
            .field("jwt_secret", &"<redacted>")
            .field("insecure_dev_secret", &self.insecure_dev_secret)
            .field("database", &self.database_url.as_ref().map(|_| "<set>"))
            .field("session_ttl", &self.session_ttl)
            .field("reset_token_ttl", &self.reset_token_ttl)
            .field("bcrypt_cost", &self.bcrypt_cost)
            .field("notifier", &self.notifier)
            .field("bootstrap_admin", &self.bootstrap_admin.as_ref().map(|a| &a.email))
            .field("session_sweep_interval", &self.session_sweep_interval)
            .field("prune_expired_on_validate", &self.prune_expired_on_validate)
            .field("cookie_secure", &self.cookie_secure)
            .finish()
    }
}

fn parse_num(value: Option<String>, key: &str) -> Result<Option<i64>> {
    value
        .map(|v| v.trim().parse::<i64>().with_context(|| format!("parse {key}")))
        .transpose()
}

fn parse_bool(value: Option<&str>, key: &str) -> Result<Option<bool>> {
    match value.map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(None),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(Some(true)),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(Some(false)),
        Some(v) => bail!("{key}: expected a boolean, got '{v}'"),
    }
}
