//! Database query functions for the `review_rule_runs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{ReviewRuleRun, RunStatus};

/// Insert payload for a run row.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub rule_row_id: Uuid,
    pub run_index: i64,
    pub agent: String,
    pub model: Option<String>,
    pub prompt: String,
}

/// Terminal fields written when a run finishes.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub raw_output: Option<String>,
    pub findings_count: i64,
    pub duration_ms: i64,
    pub error_message: Option<String>,
}

/// Insert a run row in `pending` status.
pub async fn insert_run(pool: &SqlitePool, new: &NewRun) -> Result<ReviewRuleRun> {
    let id = Uuid::now_v7();
    let created_at = Utc::now();

    sqlx::query(
        "INSERT INTO review_rule_runs (id, rule_row_id, run_index, agent, model, prompt, \
                                       status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)",
    )
    .bind(id)
    .bind(new.rule_row_id)
    .bind(new.run_index)
    .bind(&new.agent)
    .bind(&new.model)
    .bind(&new.prompt)
    .bind(created_at)
    .execute(pool)
    .await
    .context("failed to insert rule run")?;

    get_run(pool, id).await?.context("inserted run not found")
}

/// Fetch a single run by ID.
pub async fn get_run(pool: &SqlitePool, id: Uuid) -> Result<Option<ReviewRuleRun>> {
    let run = sqlx::query_as::<_, ReviewRuleRun>("SELECT * FROM review_rule_runs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch rule run")?;

    Ok(run)
}

/// All runs of one rule, in run order.
pub async fn get_runs_for_rule(pool: &SqlitePool, rule_row_id: Uuid) -> Result<Vec<ReviewRuleRun>> {
    let runs = sqlx::query_as::<_, ReviewRuleRun>(
        "SELECT * FROM review_rule_runs WHERE rule_row_id = ? ORDER BY run_index ASC",
    )
    .bind(rule_row_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch runs for rule")?;

    Ok(runs)
}

/// Mark a run `running`, stamping `started_at`.
pub async fn mark_run_running(pool: &SqlitePool, id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "UPDATE review_rule_runs SET status = 'running', started_at = ? WHERE id = ?",
    )
    .bind(started_at)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark run running")?;

    Ok(())
}

/// Finish a run with its terminal status and outcome fields.
pub async fn finish_run(
    pool: &SqlitePool,
    id: Uuid,
    status: RunStatus,
    outcome: &RunOutcome,
) -> Result<()> {
    sqlx::query(
        "UPDATE review_rule_runs \
         SET status = ?, raw_output = ?, findings_count = ?, completed_at = ?, \
             duration_ms = ?, error_message = ? \
         WHERE id = ?",
    )
    .bind(status)
    .bind(&outcome.raw_output)
    .bind(outcome.findings_count)
    .bind(Utc::now())
    .bind(outcome.duration_ms)
    .bind(&outcome.error_message)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finish run")?;

    Ok(())
}

/// Delete all runs of a rule (findings cascade). Returns rows deleted.
pub async fn delete_runs_for_rule(pool: &SqlitePool, rule_row_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM review_rule_runs WHERE rule_row_id = ?")
        .bind(rule_row_id)
        .execute(pool)
        .await
        .context("failed to delete runs for rule")?;

    Ok(result.rows_affected())
}

/// Delete the in-flight (`pending`/`running`) runs of a rule, keeping
/// completed and failed ones. Used by recovery so a re-executed rule
/// starts from a clean slate without losing history it already wrote.
pub async fn delete_inflight_runs_for_rule(pool: &SqlitePool, rule_row_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM review_rule_runs \
         WHERE rule_row_id = ? AND status IN ('pending', 'running')",
    )
    .bind(rule_row_id)
    .execute(pool)
    .await
    .context("failed to delete in-flight runs")?;

    Ok(result.rows_affected())
}

/// Count all runs belonging to a review (across its rules).
pub async fn count_runs_for_review(pool: &SqlitePool, review_id: Uuid) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM review_rule_runs \
         WHERE rule_row_id IN (SELECT id FROM review_rules WHERE review_id = ?)",
    )
    .bind(review_id)
    .fetch_one(pool)
    .await
    .context("failed to count runs for review")?;

    Ok(count)
}
