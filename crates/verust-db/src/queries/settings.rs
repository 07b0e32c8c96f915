//! Database query functions for the `settings` table.
//!
//! Settings are (category, key) -> JSON value. Callers that need typed
//! views layer them on top (see the runtime config module in the core
//! crate); this module stays at the raw JSON level.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

/// Fetch one setting, parsed as JSON. Returns `None` when absent.
pub async fn get_setting(
    pool: &SqlitePool,
    category: &str,
    key: &str,
) -> Result<Option<serde_json::Value>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT value FROM settings WHERE category = ? AND key = ?")
            .bind(category)
            .bind(key)
            .fetch_optional(pool)
            .await
            .context("failed to fetch setting")?;

    match row {
        None => Ok(None),
        Some((raw,)) => {
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("setting {category}.{key} is not valid JSON"))?;
            Ok(Some(value))
        }
    }
}

/// Upsert one setting.
pub async fn set_setting(
    pool: &SqlitePool,
    category: &str,
    key: &str,
    value: &serde_json::Value,
) -> Result<()> {
    let raw = serde_json::to_string(value).context("failed to serialize setting value")?;

    sqlx::query(
        "INSERT INTO settings (category, key, value, updated_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT (category, key) DO UPDATE SET value = excluded.value, \
                                                   updated_at = excluded.updated_at",
    )
    .bind(category)
    .bind(key)
    .bind(raw)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to upsert setting")?;

    Ok(())
}

/// Fetch all settings of one category as a key -> JSON map.
pub async fn get_category(
    pool: &SqlitePool,
    category: &str,
) -> Result<BTreeMap<String, serde_json::Value>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM settings WHERE category = ? ORDER BY key")
            .bind(category)
            .fetch_all(pool)
            .await
            .context("failed to fetch settings category")?;

    let mut map = BTreeMap::new();
    for (key, raw) in rows {
        let value = serde_json::from_str(&raw)
            .with_context(|| format!("setting {category}.{key} is not valid JSON"))?;
        map.insert(key, value);
    }
    Ok(map)
}

/// Delete one setting. Returns whether a row was removed.
pub async fn delete_setting(pool: &SqlitePool, category: &str, key: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM settings WHERE category = ? AND key = ?")
        .bind(category)
        .bind(key)
        .execute(pool)
        .await
        .context("failed to delete setting")?;

    Ok(result.rows_affected() > 0)
}
