//! Daily retention service.
//!
//! Purges task-log entries older than `review.retention_days` and sweeps
//! workspace directories orphaned by crashes. Runs at 02:00 local time;
//! the next-occurrence computation is pure so it can be tested without a
//! clock.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Days, Duration as ChronoDuration, Local, NaiveTime, Utc};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use verust_db::queries::reviews;
use verust_db::tasklog::TaskLogStore;

use crate::config::ReviewSettings;
use crate::engine::workspace::WorkspaceManager;

/// Local time of day the purge runs.
const PURGE_HOUR: u32 = 2;

/// What one retention pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub log_entries: u64,
    pub workspaces: usize,
}

/// Periodic cleanup of the task-log store and workspace root.
pub struct RetentionService {
    pool: SqlitePool,
    tasklog: TaskLogStore,
}

impl RetentionService {
    pub fn new(pool: SqlitePool, tasklog: TaskLogStore) -> Self {
        Self { pool, tasklog }
    }

    /// Spawn the daily loop. Cancelling the token stops it.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = Local::now();
                let next = next_purge_at(now);
                let wait = (next - now)
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(60));
                info!(next = %next, "retention purge scheduled");

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => break,
                }

                match self.run_once().await {
                    Ok(report) => info!(
                        log_entries = report.log_entries,
                        workspaces = report.workspaces,
                        "retention purge finished"
                    ),
                    Err(e) => warn!(error = %e, "retention purge failed"),
                }
            }
        })
    }

    /// One purge pass: logs past the retention window, plus workspace
    /// directories whose review is no longer active.
    pub async fn run_once(&self) -> Result<PurgeReport> {
        let settings = ReviewSettings::load(&self.pool).await?;
        let cutoff: DateTime<Utc> =
            Utc::now() - ChronoDuration::days(settings.retention_days.max(0));

        let log_entries = self.tasklog.purge_older_than(cutoff).await?;

        let active: HashSet<_> = reviews::get_nonterminal_reviews(&self.pool)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        let manager = WorkspaceManager::new(&settings.workspace);
        let workspaces = manager.sweep_orphans(&active);

        Ok(PurgeReport {
            log_entries,
            workspaces,
        })
    }
}

/// The next 02:00 local strictly after `now`.
fn next_purge_at(now: DateTime<Local>) -> DateTime<Local> {
    let target_time = NaiveTime::from_hms_opt(PURGE_HOUR, 0, 0).expect("valid time");
    let today = now.date_naive().and_time(target_time);

    let candidate = today
        .and_local_timezone(Local)
        .earliest()
        .unwrap_or_else(|| now + ChronoDuration::hours(24));

    if candidate > now {
        candidate
    } else {
        let tomorrow = now
            .date_naive()
            .checked_add_days(Days::new(1))
            .expect("valid date")
            .and_time(target_time);
        tomorrow
            .and_local_timezone(Local)
            .earliest()
            .unwrap_or_else(|| now + ChronoDuration::hours(24))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn purge_before_two_am_is_same_day() {
        let now = Local.with_ymd_and_hms(2025, 6, 10, 0, 30, 0).unwrap();
        let next = next_purge_at(now);
        assert_eq!(next, Local.with_ymd_and_hms(2025, 6, 10, 2, 0, 0).unwrap());
    }

    #[test]
    fn purge_after_two_am_is_next_day() {
        let now = Local.with_ymd_and_hms(2025, 6, 10, 14, 0, 0).unwrap();
        let next = next_purge_at(now);
        assert_eq!(next, Local.with_ymd_and_hms(2025, 6, 11, 2, 0, 0).unwrap());
    }

    #[test]
    fn purge_exactly_at_two_am_schedules_tomorrow() {
        let now = Local.with_ymd_and_hms(2025, 6, 10, 2, 0, 0).unwrap();
        let next = next_purge_at(now);
        assert_eq!(next, Local.with_ymd_and_hms(2025, 6, 11, 2, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn run_once_purges_old_logs() {
        use verust_test_utils::create_test_db;

        let (pool, dir) = create_test_db().await;
        let tasklog = TaskLogStore::open(&dir.path().join("logs.db")).await.unwrap();

        // Retention of 0 days: everything written "now" is already past
        // the cutoff boundary check (cutoff == now), so write and purge.
        verust_db::queries::settings::set_setting(
            &pool,
            "review",
            "retention_days",
            &serde_json::json!(0),
        )
        .await
        .unwrap();
        verust_db::queries::settings::set_setting(
            &pool,
            "review",
            "workspace",
            &serde_json::json!(dir.path().join("ws")),
        )
        .await
        .unwrap();

        tasklog
            .append(uuid::Uuid::now_v7(), "info", "old entry", serde_json::json!({}))
            .await
            .unwrap();
        // Ensure the entry's timestamp is strictly before the cutoff.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let service = RetentionService::new(pool, tasklog);
        let report = service.run_once().await.unwrap();
        assert_eq!(report.log_entries, 1);
    }
}
