//! Database query functions for the `findings` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::Finding;

/// Insert payload for a finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFinding {
    pub category: String,
    pub severity: String,
    pub file: String,
    pub line_start: i64,
    pub line_end: i64,
    pub message: String,
    pub suggestion: Option<String>,
}

/// Insert one finding attached to a run.
pub async fn insert_finding(pool: &SqlitePool, run_id: Uuid, new: &NewFinding) -> Result<Finding> {
    let id = Uuid::now_v7();
    let created_at = Utc::now();

    sqlx::query(
        "INSERT INTO findings (id, run_id, category, severity, file, line_start, line_end, \
                               message, suggestion, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(run_id)
    .bind(&new.category)
    .bind(&new.severity)
    .bind(&new.file)
    .bind(new.line_start)
    .bind(new.line_end)
    .bind(&new.message)
    .bind(&new.suggestion)
    .bind(created_at)
    .execute(pool)
    .await
    .context("failed to insert finding")?;

    let finding = sqlx::query_as::<_, Finding>("SELECT * FROM findings WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .context("inserted finding not found")?;

    Ok(finding)
}

/// Insert a batch of findings for a run in a single transaction.
pub async fn insert_findings(
    pool: &SqlitePool,
    run_id: Uuid,
    findings: &[NewFinding],
) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let created_at = Utc::now();

    for new in findings {
        sqlx::query(
            "INSERT INTO findings (id, run_id, category, severity, file, line_start, line_end, \
                                   message, suggestion, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::now_v7())
        .bind(run_id)
        .bind(&new.category)
        .bind(&new.severity)
        .bind(&new.file)
        .bind(new.line_start)
        .bind(new.line_end)
        .bind(&new.message)
        .bind(&new.suggestion)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .context("failed to insert finding")?;
    }

    tx.commit().await.context("failed to commit findings")?;
    Ok(())
}

/// All findings of one run.
pub async fn get_findings_for_run(pool: &SqlitePool, run_id: Uuid) -> Result<Vec<Finding>> {
    let findings = sqlx::query_as::<_, Finding>(
        "SELECT * FROM findings WHERE run_id = ? ORDER BY file, line_start",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch findings for run")?;

    Ok(findings)
}

/// All findings of a review, across its rules and runs.
pub async fn get_findings_for_review(pool: &SqlitePool, review_id: Uuid) -> Result<Vec<Finding>> {
    let findings = sqlx::query_as::<_, Finding>(
        "SELECT f.* FROM findings f \
         JOIN review_rule_runs rr ON rr.id = f.run_id \
         JOIN review_rules r ON r.id = rr.rule_row_id \
         WHERE r.review_id = ? \
         ORDER BY f.file, f.line_start",
    )
    .bind(review_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch findings for review")?;

    Ok(findings)
}
