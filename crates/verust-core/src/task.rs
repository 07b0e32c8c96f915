//! The in-memory task wrapper.
//!
//! A [`Task`] is the queue/dispatcher currency: a thin handle onto a
//! stored review. It is never persisted; invariant is that a task exists
//! in the queue iff its review is `pending` or `running`.

use uuid::Uuid;

use verust_db::models::Review;

/// In-memory wrapper around a review used by the queue and dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub review_id: Uuid,
    pub repo_url: String,
}

impl Task {
    pub fn new(review_id: Uuid, repo_url: impl Into<String>) -> Self {
        Self {
            review_id,
            repo_url: repo_url.into(),
        }
    }

    pub fn from_review(review: &Review) -> Self {
        Self::new(review.id, review.repo_url.clone())
    }
}
