//! Operator notifications.
//!
//! The manager fetches notification settings from the store on every
//! send (no caching, so config edits apply immediately), applies the
//! event filter, and dispatches to the configured channel. Webhook,
//! Slack and Feishu are HTTP POSTs; the email channel is accepted in
//! configuration but has no transport in this repository and is logged
//! instead.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{NotificationSettings, NotifyChannel};

/// Notification event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ReviewCompleted,
    ReviewFailed,
    ReviewCancelled,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReviewCompleted => "review_completed",
            Self::ReviewFailed => "review_failed",
            Self::ReviewCancelled => "review_cancelled",
        }
    }
}

/// One notification payload.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub event: EventType,
    pub review_id: Uuid,
    pub repo_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl NotificationEvent {
    pub fn new(event: EventType, review_id: Uuid, repo_url: impl Into<String>) -> Self {
        Self {
            event,
            review_id,
            repo_url: repo_url.into(),
            error: None,
            extra: serde_json::Value::Null,
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }
}

/// Sends notifications according to the stored configuration.
pub struct NotificationManager {
    pool: SqlitePool,
    http: reqwest::Client,
}

impl NotificationManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            http: reqwest::Client::new(),
        }
    }

    /// Deliver one event. Settings are re-read from the store per call.
    pub async fn notify(&self, event: &NotificationEvent) -> Result<()> {
        let settings = NotificationSettings::load(&self.pool)
            .await
            .context("failed to load notification settings")?;

        if settings.channel == NotifyChannel::None {
            return Ok(());
        }
        if !settings.events.is_empty()
            && !settings.events.iter().any(|e| e == event.event.as_str())
        {
            debug!(event = event.event.as_str(), "event filtered out");
            return Ok(());
        }

        match settings.channel {
            NotifyChannel::None => Ok(()),
            NotifyChannel::Webhook => {
                let url = settings
                    .webhook_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("webhook channel selected but no webhook_url"))?;
                self.post_json(url, &serde_json::to_value(event)?).await
            }
            NotifyChannel::Slack => {
                let url = settings.slack_webhook_url.as_deref().ok_or_else(|| {
                    anyhow::anyhow!("slack channel selected but no slack_webhook_url")
                })?;
                let body = serde_json::json!({ "text": render_text(event) });
                self.post_json(url, &body).await
            }
            NotifyChannel::Feishu => {
                let url = settings.feishu_webhook_url.as_deref().ok_or_else(|| {
                    anyhow::anyhow!("feishu channel selected but no feishu_webhook_url")
                })?;
                let body = serde_json::json!({
                    "msg_type": "text",
                    "content": { "text": render_text(event) }
                });
                self.post_json(url, &body).await
            }
            NotifyChannel::Email => {
                warn!(
                    to = settings.email_to.as_deref().unwrap_or("<unset>"),
                    event = event.event.as_str(),
                    "email channel configured but no SMTP transport is available; dropping"
                );
                Ok(())
            }
        }
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<()> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to post notification to {url}"))?;
        if !response.status().is_success() {
            bail!("notification endpoint returned {}", response.status());
        }
        info!(%url, "notification delivered");
        Ok(())
    }
}

/// Plain-text rendering for chat-style channels. Error text is clipped;
/// full detail stays in the store.
fn render_text(event: &NotificationEvent) -> String {
    let mut text = format!(
        "[verust] {} for {} (review {})",
        event.event.as_str(),
        event.repo_url,
        event.review_id
    );
    if let Some(error) = &event.error {
        let clipped: String = error.chars().take(500).collect();
        text.push_str(&format!("\nerror: {clipped}"));
    }
    text
}
