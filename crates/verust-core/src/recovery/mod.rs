//! Startup recovery.
//!
//! Runs once after the dispatcher is ready: every non-terminal review in
//! the store is rebuilt as an in-memory task. Reviews that were `running`
//! when the process died are installed directly into the running slot of
//! their repo (so the at-most-one-running invariant holds from the first
//! instant) and re-driven via the queue's recovery pass.
//!
//! Repair rules:
//! - A review not `running` whose rules contain a `running` row died
//!   between two transitions; it is upgraded back to `running` first.
//! - `running` rule rows reset to `pending`; their in-flight run rows are
//!   deleted so re-execution starts from a clean slate (completed runs of
//!   other rules survive and those rules are skipped by the runner).

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

use verust_db::models::ReviewStatus;
use verust_db::queries::{reviews, rules, runs};

use crate::queue::RepoTaskQueue;
use crate::task::Task;

/// What recovery did, for the startup log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered_running: usize,
    pub recovered_pending: usize,
    pub repaired_reviews: usize,
    pub reset_rules: usize,
}

/// Scan the store and re-inject all non-terminal reviews.
pub async fn run_recovery(pool: &SqlitePool, queue: &RepoTaskQueue) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for review in reviews::get_nonterminal_reviews(pool).await? {
        let mut status = review.status;

        // Repair: a non-running review with a running rule died inside
        // the rule loop.
        if status != ReviewStatus::Running && rules::review_has_running_rule(pool, review.id).await?
        {
            warn!(review_id = %review.id, "review has a running rule but is not running, repairing");
            reviews::set_review_status(pool, review.id, ReviewStatus::Running).await?;
            status = ReviewStatus::Running;
            report.repaired_reviews += 1;
        }

        // Reset rules caught mid-execution and drop their orphan runs.
        let reset = rules::reset_running_rules(pool, review.id).await?;
        for rule_id in &reset {
            runs::delete_inflight_runs_for_rule(pool, *rule_id).await?;
        }
        report.reset_rules += reset.len();

        let task = Task::from_review(&review);
        match status {
            ReviewStatus::Running => {
                if queue.enqueue_as_running(task) {
                    report.recovered_running += 1;
                } else {
                    warn!(review_id = %review.id, "recovered running review was already queued");
                }
            }
            ReviewStatus::Pending => {
                if queue.enqueue(task) {
                    report.recovered_pending += 1;
                } else {
                    warn!(review_id = %review.id, "recovered pending review was already queued");
                }
            }
            _ => {}
        }
    }

    info!(
        running = report.recovered_running,
        pending = report.recovered_pending,
        repaired = report.repaired_reviews,
        reset_rules = report.reset_rules,
        "recovery complete"
    );
    Ok(report)
}
