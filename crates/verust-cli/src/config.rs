//! Bootstrap configuration for the `verust` binary.
//!
//! Runtime behavior (concurrency, agents, providers, notifications,
//! rules) lives in the settings store and is editable while the service
//! runs. This file only covers what is needed *before* the store exists:
//! database paths, the listen address, and the webhook secret.
//!
//! Resolution priority per key: CLI flag > `VERUST_*` environment
//! variable > config file > built-in default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use verust_db::config::DbConfig;

/// On-disk config file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
    pub task_log_path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./verust.db"),
            task_log_path: PathBuf::from("./verust-task-log.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
    pub webhook_secret: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8808,
            webhook_secret: None,
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct VerustConfig {
    pub db_config: DbConfig,
    pub task_log_path: PathBuf,
    pub bind: String,
    pub port: u16,
    pub webhook_secret: Option<String>,
}

/// Path of the config file: `VERUST_CONFIG` override, else
/// `<config_dir>/verust/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("VERUST_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("verust")
        .join("config.toml")
}

/// Load the config file if present.
pub fn load_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let file: ConfigFile = toml::from_str(&raw)
        .with_context(|| format!("malformed config file {}", path.display()))?;
    Ok(Some(file))
}

/// Write the config file, creating parent directories.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let raw = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, raw)
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    Ok(path)
}

/// A fresh random webhook secret (hex, 32 bytes of entropy).
pub fn generate_webhook_secret() -> String {
    use rand::Rng;
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

impl VerustConfig {
    /// Resolve the effective configuration.
    pub fn resolve(cli_database: Option<&str>) -> Result<Self> {
        let file = load_config()?.unwrap_or_default();

        let database_path = cli_database
            .map(PathBuf::from)
            .or_else(|| std::env::var("VERUST_DATABASE_PATH").ok().map(PathBuf::from))
            .unwrap_or(file.database.path);

        let task_log_path = std::env::var("VERUST_TASK_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or(file.database.task_log_path);

        let bind = std::env::var("VERUST_BIND").unwrap_or(file.server.bind);
        let port = match std::env::var("VERUST_PORT") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("VERUST_PORT is not a port number: {raw}"))?,
            Err(_) => file.server.port,
        };
        let webhook_secret = std::env::var("VERUST_WEBHOOK_SECRET")
            .ok()
            .or(file.server.webhook_secret);

        Ok(Self {
            db_config: DbConfig::new(database_path),
            task_log_path,
            bind,
            port,
            webhook_secret,
        })
    }
}
