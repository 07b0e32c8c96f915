//! Secondary task-log store.
//!
//! Structured per-review run logs live in a *separate* SQLite file from
//! the primary store, so log churn never contends with review state
//! writes and retention can drop old rows without touching reviews.
//! The schema is a single table created at open; a migrator for a
//! one-table sidecar store is not worth carrying.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use uuid::Uuid;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS task_logs (
    id BLOB PRIMARY KEY NOT NULL,
    review_id BLOB NOT NULL,
    level TEXT NOT NULL DEFAULT 'info',
    message TEXT NOT NULL,
    fields TEXT NOT NULL DEFAULT '{}',
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_logs_review ON task_logs (review_id);
CREATE INDEX IF NOT EXISTS idx_task_logs_recorded ON task_logs (recorded_at);";

/// A structured log entry attached to a review.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct TaskLogEntry {
    pub id: Uuid,
    pub review_id: Uuid,
    pub level: String,
    pub message: String,
    pub fields: sqlx::types::Json<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

/// Handle to the task-log database file.
#[derive(Debug, Clone)]
pub struct TaskLogStore {
    pool: SqlitePool,
}

impl TaskLogStore {
    /// Open (creating if necessary) the task-log store at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open task-log store at {}", path.display()))?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("failed to create task-log schema")?;

        Ok(Self { pool })
    }

    /// Append one log entry. Best-effort callers ignore the error.
    pub async fn append(
        &self,
        review_id: Uuid,
        level: &str,
        message: &str,
        fields: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_logs (id, review_id, level, message, fields, recorded_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::now_v7())
        .bind(review_id)
        .bind(level)
        .bind(message)
        .bind(sqlx::types::Json(fields))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to append task log")?;

        Ok(())
    }

    /// All entries for one review, oldest first.
    pub async fn entries_for_review(&self, review_id: Uuid) -> Result<Vec<TaskLogEntry>> {
        let entries = sqlx::query_as::<_, TaskLogEntry>(
            "SELECT * FROM task_logs WHERE review_id = ? ORDER BY recorded_at ASC",
        )
        .bind(review_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch task logs")?;

        Ok(entries)
    }

    /// Delete entries recorded before `cutoff`. Returns rows removed.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM task_logs WHERE recorded_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("failed to purge task logs")?;

        Ok(result.rows_affected())
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Days;

    async fn open_temp_store() -> (TaskLogStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TaskLogStore::open(&dir.path().join("task-log.db"))
            .await
            .expect("open task-log store");
        (store, dir)
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let (store, _dir) = open_temp_store().await;
        let review_id = Uuid::now_v7();

        store
            .append(
                review_id,
                "info",
                "clone finished",
                serde_json::json!({"duration_ms": 1200}),
            )
            .await
            .unwrap();
        store
            .append(review_id, "warn", "agent retried", serde_json::json!({}))
            .await
            .unwrap();

        let entries = store.entries_for_review(review_id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "clone finished");
        assert_eq!(entries[0].fields.0["duration_ms"], 1200);
        assert_eq!(entries[1].level, "warn");
    }

    #[tokio::test]
    async fn entries_are_scoped_to_review() {
        let (store, _dir) = open_temp_store().await;
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();

        store
            .append(a, "info", "a", serde_json::json!({}))
            .await
            .unwrap();
        store
            .append(b, "info", "b", serde_json::json!({}))
            .await
            .unwrap();

        let entries = store.entries_for_review(a).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "a");
    }

    #[tokio::test]
    async fn purge_respects_cutoff() {
        let (store, _dir) = open_temp_store().await;
        let review_id = Uuid::now_v7();

        store
            .append(review_id, "info", "old enough?", serde_json::json!({}))
            .await
            .unwrap();

        // A cutoff in the past removes nothing.
        let removed = store
            .purge_older_than(Utc::now().checked_sub_days(Days::new(30)).unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 0);

        // A cutoff in the future removes the entry.
        let removed = store
            .purge_older_than(Utc::now().checked_add_days(Days::new(1)).unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let entries = store.entries_for_review(review_id).await.unwrap();
        assert!(entries.is_empty());
    }
}
