//! Review runner: drives the frozen rule plan of one review.
//!
//! Rules run strictly in plan order; one rule failing never aborts the
//! review. Already-settled rules (completed/skipped) are skipped, which
//! makes re-running a partially-executed review idempotent after a
//! rule-level retry or crash recovery.

pub mod executor;
pub mod parse;
pub mod prompt;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use verust_db::models::{ReviewRule, ReviewStatus, RuleStatus};
use verust_db::queries::{reviews, rules};

use executor::{ExecutionContext, RuleExecutor, RuleOutcome};

/// Result of driving a review's rule plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerResult {
    /// The plan ran to its end; finalize the review with this status.
    Finished {
        status: ReviewStatus,
        error: Option<String>,
    },
    /// Process shutdown interrupted the plan; leave the review `running`
    /// so recovery re-drives it at next boot.
    Interrupted,
}

/// Drives the rules of one review through the executor.
pub struct ReviewRunner {
    pool: SqlitePool,
    executor: RuleExecutor,
}

impl ReviewRunner {
    pub fn new(pool: SqlitePool, executor: RuleExecutor) -> Self {
        Self { pool, executor }
    }

    pub async fn run(
        &self,
        ctx: &ExecutionContext<'_>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<RunnerResult> {
        let review_id = ctx.review.id;
        let plan = rules::get_rules_for_review(&self.pool, review_id).await?;

        for rule_row in &plan {
            // Process shutdown: stop without finalizing.
            if cancel.is_cancelled() {
                return Ok(RunnerResult::Interrupted);
            }

            // Per-review cancellation is observed at rule boundaries.
            let current = reviews::get_review(&self.pool, review_id).await?;
            if matches!(current.map(|r| r.status), Some(ReviewStatus::Cancelled)) {
                info!(%review_id, "review cancelled, skipping remaining rules");
                self.cancel_pending_rules(review_id).await?;
                break;
            }

            if rule_row.status.is_settled() {
                continue;
            }

            // Only a pending rule is executed; a rule left `failed` by an
            // earlier pass keeps its state (rule-level retry resets it).
            let won = rules::mark_rule_running_if_pending(&self.pool, rule_row.id).await?;
            if won == 0 {
                continue;
            }

            reviews::set_current_rule_index(&self.pool, review_id, rule_row.rule_index).await?;
            info!(%review_id, rule_id = %rule_row.rule_id, index = rule_row.rule_index, "executing rule");

            match self.executor.execute(ctx, rule_row, cancel).await {
                Ok(RuleOutcome::Completed { findings }) => {
                    info!(rule_id = %rule_row.rule_id, findings, "rule completed");
                    rules::set_rule_status(&self.pool, rule_row.id, RuleStatus::Completed, None)
                        .await?;
                }
                Ok(RuleOutcome::Failed { error }) => {
                    warn!(rule_id = %rule_row.rule_id, error = %error, "rule failed");
                    rules::set_rule_status(
                        &self.pool,
                        rule_row.id,
                        RuleStatus::Failed,
                        Some(&error),
                    )
                    .await?;
                }
                Ok(RuleOutcome::Cancelled) => {
                    rules::set_rule_status(&self.pool, rule_row.id, RuleStatus::Cancelled, None)
                        .await?;
                    // Shutdown vs per-review cancel is decided at the top
                    // of the next iteration.
                }
                Err(e) => {
                    // Store-level failure recording the outcome; the rule
                    // must not be left `running`.
                    warn!(rule_id = %rule_row.rule_id, error = %e, "rule execution errored");
                    rules::set_rule_status(
                        &self.pool,
                        rule_row.id,
                        RuleStatus::Failed,
                        Some(&format!("{e:#}")),
                    )
                    .await?;
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(RunnerResult::Interrupted);
        }

        let final_rules = rules::get_rules_for_review(&self.pool, review_id).await?;
        let (status, error) = terminal_status(&final_rules);
        Ok(RunnerResult::Finished { status, error })
    }

    async fn cancel_pending_rules(&self, review_id: uuid::Uuid) -> anyhow::Result<()> {
        let plan = rules::get_rules_for_review(&self.pool, review_id).await?;
        for rule_row in plan {
            if rule_row.status == RuleStatus::Pending {
                rules::set_rule_status(&self.pool, rule_row.id, RuleStatus::Cancelled, None)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Review terminal status from its settled rule plan.
///
/// - everything completed/skipped: `completed`
/// - any cancelled, nothing completed, nothing failed: `cancelled`
/// - any failed (or anything inexplicably unsettled): `failed`
/// - cancelled rules alongside completed ones do not fail the review;
///   the cancellation stays recorded on the rule rows.
///
/// Failure outranks cancellation: a plan with a failed rule reports
/// `failed` even when its other rules were cancelled, so the failure
/// (and its error message) stays actionable for the retry path.
pub fn terminal_status(plan: &[ReviewRule]) -> (ReviewStatus, Option<String>) {
    let any_completed = plan.iter().any(|r| r.status == RuleStatus::Completed);
    let any_cancelled = plan.iter().any(|r| r.status == RuleStatus::Cancelled);
    let failed: Vec<&str> = plan
        .iter()
        .filter(|r| r.status == RuleStatus::Failed)
        .map(|r| r.rule_id.as_str())
        .collect();
    let unsettled = plan
        .iter()
        .any(|r| matches!(r.status, RuleStatus::Pending | RuleStatus::Running));

    if any_cancelled && !any_completed && failed.is_empty() {
        return (ReviewStatus::Cancelled, None);
    }
    if !failed.is_empty() {
        return (
            ReviewStatus::Failed,
            Some(format!("rules failed: {}", failed.join(", "))),
        );
    }
    if unsettled {
        return (
            ReviewStatus::Failed,
            Some("rule plan did not settle".to_string()),
        );
    }
    (ReviewStatus::Completed, None)
}
