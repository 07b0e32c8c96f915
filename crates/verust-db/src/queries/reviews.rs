//! Database query functions for the `reviews` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{Review, ReviewStatus};

/// Insert payload for a new review.
#[derive(Debug, Clone, Default)]
pub struct NewReview {
    pub repo_url: String,
    pub git_ref: String,
    pub commit_sha: String,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    pub base_commit_sha: Option<String>,
    pub pr_title: Option<String>,
    pub pr_description: Option<String>,
    pub changed_files: Vec<String>,
    pub author: Option<String>,
    pub source: String,
    pub triggered_by: Option<String>,
}

/// Diff statistics for the `base..head` range of a review.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub lines_added: i64,
    pub lines_deleted: i64,
    pub files_changed: i64,
    pub commit_count: i64,
    pub branch_created_at: Option<DateTime<Utc>>,
}

/// Review counts by status.
#[derive(Debug, Clone, Default)]
pub struct ReviewCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

/// Insert a new review row in `pending` status.
///
/// The id is a v7 UUID, so review ids sort by creation time.
pub async fn insert_review(pool: &SqlitePool, new: &NewReview) -> Result<Review> {
    let id = Uuid::now_v7();
    let created_at = Utc::now();

    sqlx::query(
        "INSERT INTO reviews (id, repo_url, git_ref, commit_sha, pr_number, pr_url, \
                              base_commit_sha, pr_title, pr_description, changed_files, \
                              author, source, triggered_by, status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)",
    )
    .bind(id)
    .bind(&new.repo_url)
    .bind(&new.git_ref)
    .bind(&new.commit_sha)
    .bind(new.pr_number)
    .bind(&new.pr_url)
    .bind(&new.base_commit_sha)
    .bind(&new.pr_title)
    .bind(&new.pr_description)
    .bind(Json(new.changed_files.clone()))
    .bind(&new.author)
    .bind(&new.source)
    .bind(&new.triggered_by)
    .bind(created_at)
    .execute(pool)
    .await
    .context("failed to insert review")?;

    get_review(pool, id)
        .await?
        .context("inserted review row not found")
}

/// Fetch a single review by ID.
pub async fn get_review(pool: &SqlitePool, id: Uuid) -> Result<Option<Review>> {
    let review = sqlx::query_as::<_, Review>("SELECT * FROM reviews WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch review")?;

    Ok(review)
}

/// List the most recent reviews, newest first.
pub async fn list_recent_reviews(pool: &SqlitePool, limit: i64) -> Result<Vec<Review>> {
    let reviews =
        sqlx::query_as::<_, Review>("SELECT * FROM reviews ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(pool)
            .await
            .context("failed to list reviews")?;

    Ok(reviews)
}

/// All reviews in a non-terminal status (`pending` or `running`), oldest
/// first. Used by startup recovery.
pub async fn get_nonterminal_reviews(pool: &SqlitePool) -> Result<Vec<Review>> {
    let reviews = sqlx::query_as::<_, Review>(
        "SELECT * FROM reviews \
         WHERE status IN ('pending', 'running') \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to fetch non-terminal reviews")?;

    Ok(reviews)
}

/// Atomically transition a review from one status to another.
///
/// The UPDATE's WHERE clause includes `status = from`, so the row is only
/// updated if the stored status matches. Returns rows affected (0 means
/// the status did not match or the review does not exist).
pub async fn update_review_status(
    pool: &SqlitePool,
    id: Uuid,
    from: ReviewStatus,
    to: ReviewStatus,
) -> Result<u64> {
    let result = sqlx::query("UPDATE reviews SET status = ? WHERE id = ? AND status = ?")
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(pool)
        .await
        .context("failed to transition review status")?;

    Ok(result.rows_affected())
}

/// CAS `pending -> running`, stamping `started_at`. Exactly one of any
/// number of racing workers wins this transition.
pub async fn mark_review_running_if_pending(
    pool: &SqlitePool,
    id: Uuid,
    started_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE reviews SET status = 'running', started_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(started_at)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark review running")?;

    Ok(result.rows_affected())
}

/// Unconditionally set a review's status. Used by recovery repair and by
/// cancellation (where the caller has already decided the outcome).
pub async fn set_review_status(pool: &SqlitePool, id: Uuid, status: ReviewStatus) -> Result<u64> {
    let result = sqlx::query("UPDATE reviews SET status = ? WHERE id = ?")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set review status")?;

    Ok(result.rows_affected())
}

/// Record which rule the runner is currently on.
pub async fn set_current_rule_index(pool: &SqlitePool, id: Uuid, index: i64) -> Result<()> {
    sqlx::query("UPDATE reviews SET current_rule_index = ? WHERE id = ?")
        .bind(index)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set current rule index")?;

    Ok(())
}

/// Fill in pull-request metadata fetched from the provider.
///
/// Uses COALESCE so values already present (e.g. supplied by the webhook
/// payload) are not overwritten.
pub async fn update_pr_metadata(
    pool: &SqlitePool,
    id: Uuid,
    title: Option<&str>,
    description: Option<&str>,
    author: Option<&str>,
    base_commit_sha: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE reviews \
         SET pr_title = COALESCE(pr_title, ?), \
             pr_description = COALESCE(pr_description, ?), \
             author = COALESCE(author, ?), \
             base_commit_sha = COALESCE(base_commit_sha, ?) \
         WHERE id = ?",
    )
    .bind(title)
    .bind(description)
    .bind(author)
    .bind(base_commit_sha)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update review PR metadata")?;

    Ok(())
}

/// Persist diff statistics for the review's commit range.
pub async fn update_diff_stats(pool: &SqlitePool, id: Uuid, stats: &DiffStats) -> Result<()> {
    sqlx::query(
        "UPDATE reviews \
         SET lines_added = ?, lines_deleted = ?, files_changed = ?, \
             commit_count = ?, branch_created_at = ? \
         WHERE id = ?",
    )
    .bind(stats.lines_added)
    .bind(stats.lines_deleted)
    .bind(stats.files_changed)
    .bind(stats.commit_count)
    .bind(stats.branch_created_at)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update review diff stats")?;

    Ok(())
}

/// Record the changed-file list discovered from the diff.
pub async fn update_changed_files(pool: &SqlitePool, id: Uuid, files: &[String]) -> Result<()> {
    sqlx::query("UPDATE reviews SET changed_files = ? WHERE id = ?")
        .bind(Json(files.to_vec()))
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update review changed files")?;

    Ok(())
}

/// Finalize a review: CAS `running -> <terminal>` with completion
/// timestamps and the error message (cleared on success).
///
/// Returns rows affected; 0 means the review was no longer `running`
/// (e.g. it was cancelled out from under the worker), which callers treat
/// as "someone else already decided the outcome".
pub async fn finish_review(
    pool: &SqlitePool,
    id: Uuid,
    status: ReviewStatus,
    error_message: Option<&str>,
    completed_at: DateTime<Utc>,
    duration_ms: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE reviews \
         SET status = ?, error_message = ?, completed_at = ?, duration_ms = ? \
         WHERE id = ? AND status = 'running'",
    )
    .bind(status)
    .bind(error_message)
    .bind(completed_at)
    .bind(duration_ms)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finalize review")?;

    Ok(result.rows_affected())
}

/// Get a summary of review counts by status.
pub async fn count_reviews_by_status(pool: &SqlitePool) -> Result<ReviewCounts> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM reviews GROUP BY status")
            .fetch_all(pool)
            .await
            .context("failed to count reviews")?;

    let mut counts = ReviewCounts::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => counts.pending = *count,
            "running" => counts.running = *count,
            "completed" => counts.completed = *count,
            "failed" => counts.failed = *count,
            "cancelled" => counts.cancelled = *count,
            _ => {}
        }
        counts.total += count;
    }
    Ok(counts)
}
