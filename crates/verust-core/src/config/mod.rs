//! Typed views over the runtime settings store.
//!
//! Settings live in the `settings` table as (category, key) -> JSON and
//! are edited through the API/CLI while the service runs. Each typed
//! struct here loads one category, with serde defaults filling the gaps,
//! so a half-configured installation still starts.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use verust_db::queries::settings;

/// `review` category: scheduler and workspace knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReviewSettings {
    pub max_concurrent: usize,
    pub max_retries: i64,
    pub retry_delay: u64,
    pub retention_days: i64,
    pub workspace: PathBuf,
    pub output_language: String,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_retries: 3,
            retry_delay: 30,
            retention_days: 30,
            workspace: PathBuf::from("./workspace"),
            output_language: "en".to_string(),
        }
    }
}

/// One agent backend, keyed by logical name in the `agents` category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    pub cli_path: String,
    pub api_key: Option<String>,
    /// Per-invocation timeout in seconds.
    pub timeout: u64,
    pub default_model: Option<String>,
    pub fallback_models: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            cli_path: String::new(),
            api_key: None,
            timeout: 300,
            default_model: None,
            fallback_models: Vec::new(),
        }
    }
}

/// One git provider host, keyed by host name in the `providers` category.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderSettings {
    pub token: Option<String>,
    pub insecure_skip_verify: bool,
}

/// Notification channel selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyChannel {
    #[default]
    None,
    Webhook,
    Email,
    Slack,
    Feishu,
}

/// `notifications` category.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationSettings {
    pub channel: NotifyChannel,
    /// Event filter; empty means "all events".
    pub events: Vec<String>,
    pub webhook_url: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub feishu_webhook_url: Option<String>,
    pub email_to: Option<String>,
    pub email_from: Option<String>,
}

fn category_as_struct<T: serde::de::DeserializeOwned>(
    map: BTreeMap<String, serde_json::Value>,
    category: &str,
) -> Result<T> {
    let object = serde_json::Value::Object(map.into_iter().collect());
    serde_json::from_value(object)
        .with_context(|| format!("malformed settings in category {category}"))
}

impl ReviewSettings {
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let map = settings::get_category(pool, "review").await?;
        category_as_struct(map, "review")
    }
}

impl NotificationSettings {
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let map = settings::get_category(pool, "notifications").await?;
        category_as_struct(map, "notifications")
    }
}

/// Load the agent map: logical name -> settings.
pub async fn load_agent_settings(pool: &SqlitePool) -> Result<BTreeMap<String, AgentSettings>> {
    let map = settings::get_category(pool, "agents").await?;
    let mut agents = BTreeMap::new();
    for (name, value) in map {
        let parsed: AgentSettings = serde_json::from_value(value)
            .with_context(|| format!("malformed agent settings for {name}"))?;
        agents.insert(name, parsed);
    }
    Ok(agents)
}

/// Load the provider map: host -> settings.
pub async fn load_provider_settings(
    pool: &SqlitePool,
) -> Result<BTreeMap<String, ProviderSettings>> {
    let map = settings::get_category(pool, "providers").await?;
    let mut providers = BTreeMap::new();
    for (host, value) in map {
        let parsed: ProviderSettings = serde_json::from_value(value)
            .with_context(|| format!("malformed provider settings for {host}"))?;
        providers.insert(host, parsed);
    }
    Ok(providers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use verust_db::queries::settings::set_setting;
    use verust_test_utils::create_test_db;

    #[tokio::test]
    async fn review_settings_default_when_unset() {
        let (pool, _dir) = create_test_db().await;
        let loaded = ReviewSettings::load(&pool).await.unwrap();
        assert_eq!(loaded, ReviewSettings::default());
        assert_eq!(loaded.max_concurrent, 4);
    }

    #[tokio::test]
    async fn review_settings_partial_override() {
        let (pool, _dir) = create_test_db().await;
        set_setting(&pool, "review", "max_concurrent", &serde_json::json!(16))
            .await
            .unwrap();
        set_setting(&pool, "review", "workspace", &serde_json::json!("/srv/ws"))
            .await
            .unwrap();

        let loaded = ReviewSettings::load(&pool).await.unwrap();
        assert_eq!(loaded.max_concurrent, 16);
        assert_eq!(loaded.workspace, PathBuf::from("/srv/ws"));
        // Untouched keys keep their defaults.
        assert_eq!(loaded.max_retries, 3);
        assert_eq!(loaded.retention_days, 30);
    }

    #[tokio::test]
    async fn agent_map_loads_each_entry() {
        let (pool, _dir) = create_test_db().await;
        set_setting(
            &pool,
            "agents",
            "claude",
            &serde_json::json!({
                "cli_path": "claude",
                "timeout": 600,
                "default_model": "sonnet",
                "fallback_models": ["haiku"]
            }),
        )
        .await
        .unwrap();
        set_setting(
            &pool,
            "agents",
            "copilot",
            &serde_json::json!({"cli_path": "copilot"}),
        )
        .await
        .unwrap();

        let agents = load_agent_settings(&pool).await.unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents["claude"].timeout, 600);
        assert_eq!(agents["claude"].fallback_models, vec!["haiku"]);
        assert_eq!(agents["copilot"].timeout, 300, "default timeout applies");
    }

    #[tokio::test]
    async fn notification_settings_channel_parse() {
        let (pool, _dir) = create_test_db().await;
        set_setting(&pool, "notifications", "channel", &serde_json::json!("slack"))
            .await
            .unwrap();
        set_setting(
            &pool,
            "notifications",
            "events",
            &serde_json::json!(["review_failed"]),
        )
        .await
        .unwrap();

        let loaded = NotificationSettings::load(&pool).await.unwrap();
        assert_eq!(loaded.channel, NotifyChannel::Slack);
        assert_eq!(loaded.events, vec!["review_failed"]);
    }

    #[tokio::test]
    async fn provider_map_defaults() {
        let (pool, _dir) = create_test_db().await;
        set_setting(
            &pool,
            "providers",
            "github.com",
            &serde_json::json!({"token": "ghp_x"}),
        )
        .await
        .unwrap();

        let providers = load_provider_settings(&pool).await.unwrap();
        assert_eq!(providers["github.com"].token.as_deref(), Some("ghp_x"));
        assert!(!providers["github.com"].insecure_skip_verify);
    }
}
