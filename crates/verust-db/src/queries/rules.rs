//! Database query functions for the `review_rules` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{ReviewRule, RuleStatus};

/// Insert payload for one rule row of a review's execution plan.
#[derive(Debug, Clone)]
pub struct NewReviewRule {
    pub review_id: Uuid,
    pub rule_index: i64,
    pub rule_id: String,
    pub rule_config: serde_json::Value,
    pub multi_run_enabled: bool,
    pub multi_run_runs: i64,
}

/// Insert a single rule row in `pending` status.
pub async fn insert_rule(pool: &SqlitePool, new: &NewReviewRule) -> Result<ReviewRule> {
    let id = Uuid::now_v7();
    let created_at = Utc::now();

    sqlx::query(
        "INSERT INTO review_rules (id, review_id, rule_index, rule_id, rule_config, \
                                   multi_run_enabled, multi_run_runs, status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?)",
    )
    .bind(id)
    .bind(new.review_id)
    .bind(new.rule_index)
    .bind(&new.rule_id)
    .bind(Json(new.rule_config.clone()))
    .bind(new.multi_run_enabled)
    .bind(new.multi_run_runs.max(1))
    .bind(created_at)
    .execute(pool)
    .await
    .context("failed to insert review rule")?;

    get_rule(pool, id)
        .await?
        .context("inserted rule row not found")
}

/// Fetch a single rule row by ID.
pub async fn get_rule(pool: &SqlitePool, id: Uuid) -> Result<Option<ReviewRule>> {
    let rule = sqlx::query_as::<_, ReviewRule>("SELECT * FROM review_rules WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch review rule")?;

    Ok(rule)
}

/// All rule rows for a review, in plan order.
pub async fn get_rules_for_review(pool: &SqlitePool, review_id: Uuid) -> Result<Vec<ReviewRule>> {
    let rules = sqlx::query_as::<_, ReviewRule>(
        "SELECT * FROM review_rules WHERE review_id = ? ORDER BY rule_index ASC",
    )
    .bind(review_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch rules for review")?;

    Ok(rules)
}

/// Find a rule row by its declarative rule name within a review.
pub async fn find_rule_by_rule_id(
    pool: &SqlitePool,
    review_id: Uuid,
    rule_id: &str,
) -> Result<Option<ReviewRule>> {
    let rule = sqlx::query_as::<_, ReviewRule>(
        "SELECT * FROM review_rules WHERE review_id = ? AND rule_id = ? \
         ORDER BY rule_index ASC LIMIT 1",
    )
    .bind(review_id)
    .bind(rule_id)
    .fetch_optional(pool)
    .await
    .context("failed to find rule by rule id")?;

    Ok(rule)
}

/// CAS `pending -> running` for a rule row. Returns rows affected.
pub async fn mark_rule_running_if_pending(pool: &SqlitePool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE review_rules SET status = 'running' WHERE id = ? AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark rule running")?;

    Ok(result.rows_affected())
}

/// Set a rule row's status (and error message, cleared when `None`).
pub async fn set_rule_status(
    pool: &SqlitePool,
    id: Uuid,
    status: RuleStatus,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE review_rules SET status = ?, error_message = ? WHERE id = ?")
        .bind(status)
        .bind(error_message)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set rule status")?;

    Ok(())
}

/// True when every rule of the review is still `pending` and no run rows
/// exist -- i.e. execution has not begun and the plan may be re-frozen.
pub async fn plan_untouched(pool: &SqlitePool, review_id: Uuid) -> Result<bool> {
    let (non_pending,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM review_rules WHERE review_id = ? AND status != 'pending'",
    )
    .bind(review_id)
    .fetch_one(pool)
    .await
    .context("failed to count non-pending rules")?;

    if non_pending > 0 {
        return Ok(false);
    }

    let (runs,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM review_rule_runs \
         WHERE rule_row_id IN (SELECT id FROM review_rules WHERE review_id = ?)",
    )
    .bind(review_id)
    .fetch_one(pool)
    .await
    .context("failed to count runs for review")?;

    Ok(runs == 0)
}

/// Replace a review's rule plan in one transaction.
///
/// Deletes the existing rows (runs and findings cascade) and inserts the
/// new plan. Only valid while the plan is untouched; callers check with
/// [`plan_untouched`] first.
pub async fn replace_rules_for_review(
    pool: &SqlitePool,
    review_id: Uuid,
    rules: &[NewReviewRule],
) -> Result<Vec<ReviewRule>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    sqlx::query("DELETE FROM review_rules WHERE review_id = ?")
        .bind(review_id)
        .execute(&mut *tx)
        .await
        .context("failed to delete old rule plan")?;

    let created_at = Utc::now();
    for rule in rules {
        sqlx::query(
            "INSERT INTO review_rules (id, review_id, rule_index, rule_id, rule_config, \
                                       multi_run_enabled, multi_run_runs, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?)",
        )
        .bind(Uuid::now_v7())
        .bind(review_id)
        .bind(rule.rule_index)
        .bind(&rule.rule_id)
        .bind(Json(rule.rule_config.clone()))
        .bind(rule.multi_run_enabled)
        .bind(rule.multi_run_runs.max(1))
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .context("failed to insert replacement rule")?;
    }

    tx.commit().await.context("failed to commit rule plan")?;

    get_rules_for_review(pool, review_id).await
}

/// Reviews whose rules contain a `running` row. Recovery uses this to
/// repair reviews that died between a rule transition and the review
/// transition.
pub async fn review_has_running_rule(pool: &SqlitePool, review_id: Uuid) -> Result<bool> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM review_rules WHERE review_id = ? AND status = 'running'",
    )
    .bind(review_id)
    .fetch_one(pool)
    .await
    .context("failed to count running rules")?;

    Ok(count > 0)
}

/// Reset every `running` rule of a review back to `pending`.
///
/// Returns the ids of the rules that were reset.
pub async fn reset_running_rules(pool: &SqlitePool, review_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM review_rules WHERE review_id = ? AND status = 'running'",
    )
    .bind(review_id)
    .fetch_all(pool)
    .await
    .context("failed to list running rules")?;

    for (id,) in &rows {
        sqlx::query("UPDATE review_rules SET status = 'pending' WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .context("failed to reset running rule")?;
    }

    Ok(rows.into_iter().map(|(id,)| id).collect())
}
