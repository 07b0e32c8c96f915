//! Operator-initiated retries.
//!
//! Reviews are never retried automatically; the handler here backs the
//! API/CLI retry surface. Review-level retries are capped by
//! `review.max_retries`; rule-level retries are partial repairs and do
//! not consume a retry.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use verust_db::models::{Review, ReviewStatus};
use verust_db::queries::{retry as retry_queries, reviews, rules};

use crate::config::ReviewSettings;
use crate::queue::RepoTaskQueue;
use crate::task::Task;

/// Why a retry request was rejected.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("review {0} not found")]
    NotFound(Uuid),

    #[error("review {0} already has a queued or running task")]
    AlreadyQueued(Uuid),

    #[error("review {id} is {status}; only failed reviews can be retried")]
    InvalidStatus { id: Uuid, status: ReviewStatus },

    #[error("review {id} exhausted its retry budget ({max} retries)")]
    RetriesExhausted { id: Uuid, max: i64 },

    #[error("rule {rule_id} not found in review {review_id}")]
    RuleNotFound { review_id: Uuid, rule_id: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Resets failed reviews (or single failed rules) and re-enqueues them.
pub struct RetryHandler {
    pool: SqlitePool,
    queue: Arc<RepoTaskQueue>,
}

impl RetryHandler {
    pub fn new(pool: SqlitePool, queue: Arc<RepoTaskQueue>) -> Self {
        Self { pool, queue }
    }

    /// Whole-review retry: reset review + rules, delete runs, enqueue.
    pub async fn retry(&self, review_id: Uuid) -> Result<Review, RetryError> {
        let review = reviews::get_review(&self.pool, review_id)
            .await?
            .ok_or(RetryError::NotFound(review_id))?;

        if self.queue.has_task(review_id) {
            return Err(RetryError::AlreadyQueued(review_id));
        }
        if review.status != ReviewStatus::Failed {
            return Err(RetryError::InvalidStatus {
                id: review_id,
                status: review.status,
            });
        }

        let settings = ReviewSettings::load(&self.pool).await?;
        if review.retry_count >= settings.max_retries {
            return Err(RetryError::RetriesExhausted {
                id: review_id,
                max: settings.max_retries,
            });
        }

        retry_queries::reset_review_for_retry(&self.pool, review_id).await?;

        let review = reviews::get_review(&self.pool, review_id)
            .await?
            .ok_or(RetryError::NotFound(review_id))?;
        self.queue.enqueue(Task::from_review(&review));

        info!(%review_id, retry_count = review.retry_count, "review re-enqueued for retry");
        Ok(review)
    }

    /// Single-rule retry: reset one rule of a review and enqueue. The
    /// review's `retry_count` is untouched, and (unlike [`Self::retry`])
    /// any existing review qualifies -- the reset flips the review back
    /// to `pending` only when it is terminally failed.
    pub async fn retry_rule(&self, review_id: Uuid, rule_id: &str) -> Result<Review, RetryError> {
        reviews::get_review(&self.pool, review_id)
            .await?
            .ok_or(RetryError::NotFound(review_id))?;

        if self.queue.has_task(review_id) {
            return Err(RetryError::AlreadyQueued(review_id));
        }

        let rule = rules::find_rule_by_rule_id(&self.pool, review_id, rule_id)
            .await?
            .ok_or_else(|| RetryError::RuleNotFound {
                review_id,
                rule_id: rule_id.to_string(),
            })?;

        retry_queries::reset_rule_for_retry(&self.pool, review_id, rule.id).await?;

        let review = reviews::get_review(&self.pool, review_id)
            .await?
            .ok_or(RetryError::NotFound(review_id))?;
        self.queue.enqueue(Task::from_review(&review));

        info!(%review_id, rule_id, "rule re-enqueued for retry");
        Ok(review)
    }
}
