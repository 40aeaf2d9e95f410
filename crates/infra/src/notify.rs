//! Outbound notification channel for password-reset links.
//!
//! The implementation is chosen once at startup by [`NotifierConfig::resolve`]
//! and bound for the life of the process.

use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// A reset link addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetNotice {
    pub to: String,
    pub reset_link: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_password_reset(&self, notice: &ResetNotice) -> Result<(), NotifyError>;

    fn channel_name(&self) -> &'static str;
}

/// Writes a structured log line instead of sending anything.
///
/// The link itself is never logged: it carries a live credential.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_password_reset(&self, notice: &ResetNotice) -> Result<(), NotifyError> {
        info!(to = %notice.to, "password reset link issued (log notifier)");
        Ok(())
    }

    fn channel_name(&self) -> &'static str {
        "log"
    }
}

/// POSTs each notice as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    kind: &'static str,
    #[serde(flatten)]
    notice: &'a ResetNotice,
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_password_reset(&self, notice: &ResetNotice) -> Result<(), NotifyError> {
        let payload = WebhookPayload {
            kind: "password_reset",
            notice,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        Ok(())
    }

    fn channel_name(&self) -> &'static str {
        "webhook"
    }
}

/// Keeps every notice in memory. For tests and local tooling.
#[derive(Debug, Default)]
pub struct OutboxNotifier {
    sent: Mutex<Vec<ResetNotice>>,
}

impl OutboxNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<ResetNotice> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    pub fn last_to(&self, to: &str) -> Option<ResetNotice> {
        self.sent().into_iter().rev().find(|n| n.to == to)
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn send_password_reset(&self, notice: &ResetNotice) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .map_err(|_| NotifyError::Delivery("outbox lock poisoned".to_string()))?
            .push(notice.clone());
        Ok(())
    }

    fn channel_name(&self) -> &'static str {
        "outbox"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierConfig {
    Log,
    Webhook { url: String },
}

impl NotifierConfig {
    /// Resolve the channel from an explicit kind (`log` or `webhook`).
    ///
    /// A webhook URL alone does not select the webhook channel.
    pub fn resolve(kind: Option<&str>, webhook_url: Option<&str>) -> anyhow::Result<Self> {
        let kind = kind.map(str::trim).filter(|k| !k.is_empty()).unwrap_or("log");
        match kind.to_ascii_lowercase().as_str() {
            "log" => {
                if webhook_url.is_some() {
                    tracing::warn!("NOTIFIER_WEBHOOK_URL is set but NOTIFIER is 'log'; ignoring it");
                }
                Ok(Self::Log)
            }
            "webhook" => {
                let url = webhook_url
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .context("NOTIFIER=webhook requires NOTIFIER_WEBHOOK_URL")?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    bail!("NOTIFIER_WEBHOOK_URL must be an http(s) URL");
                }
                Ok(Self::Webhook {
                    url: url.to_string(),
                })
            }
            other => bail!("unknown NOTIFIER '{other}' (expected 'log' or 'webhook')"),
        }
    }

    pub fn build(&self) -> Arc<dyn Notifier> {
        match self {
            NotifierConfig::Log => Arc::new(LogNotifier),
            NotifierConfig::Webhook { url } => Arc::new(WebhookNotifier::new(url.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_log() {
        assert_eq!(NotifierConfig::resolve(None, None).unwrap(), NotifierConfig::Log);
        assert_eq!(NotifierConfig::resolve(Some(" "), None).unwrap(), NotifierConfig::Log);
    }

    #[test]
    fn url_alone_does_not_pick_webhook() {
        assert_eq!(
            NotifierConfig::resolve(None, Some("https://hooks.example.com/reset")).unwrap(),
            NotifierConfig::Log
        );
    }

    #[test]
    fn webhook_requires_valid_url() {
        assert!(NotifierConfig::resolve(Some("webhook"), None).is_err());
        assert!(NotifierConfig::resolve(Some("webhook"), Some("ftp://x")).is_err());
        assert_eq!(
            NotifierConfig::resolve(Some("Webhook"), Some("https://hooks.example.com/reset")).unwrap(),
            NotifierConfig::Webhook {
                url: "https://hooks.example.com/reset".to_string()
            }
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(NotifierConfig::resolve(Some("smtp"), None).is_err());
    }

    #[tokio::test]
    async fn outbox_records_notices() {
        let outbox = OutboxNotifier::new();
        let notice = ResetNotice {
            to: "a@example.com".to_string(),
            reset_link: "https://app/reset?token=abc".to_string(),
        };
        outbox.send_password_reset(&notice).await.unwrap();
        assert_eq!(outbox.last_to("a@example.com"), Some(notice));
        assert!(outbox.last_to("b@example.com").is_none());
    }
}
