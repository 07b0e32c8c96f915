//! Single-transaction retry resets.
//!
//! Both resets must be atomic: a crash between "rules reset" and "runs
//! deleted" would leave a half-retried review that the runner could
//! misinterpret, so every step happens inside one transaction.

use anyhow::{Context, Result, bail};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Reset a failed review for a whole-review retry.
///
/// Within one transaction:
/// - CAS the review `failed -> pending`, bump `retry_count`, reset
///   `current_rule_index`, clear error/timing fields.
/// - Reset every rule row to `pending`.
/// - Delete every run row (findings cascade).
///
/// Returns an error if the review is not currently `failed`.
pub async fn reset_review_for_retry(pool: &SqlitePool, review_id: Uuid) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let result = sqlx::query(
        "UPDATE reviews \
         SET status = 'pending', retry_count = retry_count + 1, current_rule_index = 0, \
             error_message = NULL, started_at = NULL, completed_at = NULL, duration_ms = NULL \
         WHERE id = ? AND status = 'failed'",
    )
    .bind(review_id)
    .execute(&mut *tx)
    .await
    .context("failed to reset review for retry")?;

    if result.rows_affected() == 0 {
        bail!("review {review_id} is not in failed status");
    }

    sqlx::query(
        "UPDATE review_rules SET status = 'pending', error_message = NULL WHERE review_id = ?",
    )
    .bind(review_id)
    .execute(&mut *tx)
    .await
    .context("failed to reset rules for retry")?;

    sqlx::query(
        "DELETE FROM review_rule_runs \
         WHERE rule_row_id IN (SELECT id FROM review_rules WHERE review_id = ?)",
    )
    .bind(review_id)
    .execute(&mut *tx)
    .await
    .context("failed to delete runs for retry")?;

    tx.commit().await.context("failed to commit retry reset")?;
    Ok(())
}

/// Reset a single rule of a review for a rule-level retry.
///
/// Within one transaction:
/// - Reset the target rule row to `pending` and clear its error.
/// - Delete the rule's run rows (findings cascade).
/// - If the review is terminally `failed`, flip it back to `pending`
///   (leaving `retry_count` untouched -- a rule retry is a partial
///   repair, not a new review attempt).
///
/// Returns an error if the rule does not exist in this review.
pub async fn reset_rule_for_retry(
    pool: &SqlitePool,
    review_id: Uuid,
    rule_row_id: Uuid,
) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let result = sqlx::query(
        "UPDATE review_rules SET status = 'pending', error_message = NULL \
         WHERE id = ? AND review_id = ?",
    )
    .bind(rule_row_id)
    .bind(review_id)
    .execute(&mut *tx)
    .await
    .context("failed to reset rule for retry")?;

    if result.rows_affected() == 0 {
        bail!("rule {rule_row_id} not found in review {review_id}");
    }

    sqlx::query("DELETE FROM review_rule_runs WHERE rule_row_id = ?")
        .bind(rule_row_id)
        .execute(&mut *tx)
        .await
        .context("failed to delete rule runs for retry")?;

    sqlx::query(
        "UPDATE reviews \
         SET status = 'pending', error_message = NULL, completed_at = NULL, duration_ms = NULL \
         WHERE id = ? AND status = 'failed'",
    )
    .bind(review_id)
    .execute(&mut *tx)
    .await
    .context("failed to reopen review for rule retry")?;

    tx.commit()
        .await
        .context("failed to commit rule retry reset")?;
    Ok(())
}
