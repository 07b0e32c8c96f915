//! The engine: composition root and worker body.
//!
//! `submit` is the synchronous entry point (store rows + enqueue; it
//! never blocks on the pipeline). `process_task` is the worker body the
//! dispatcher drives: re-read, CAS to running, clone, enrich, diff
//! stats, rule-plan freeze, run rules, finalize, notify. The workspace
//! directory is removed on every exit path via a drop guard.

pub mod workspace;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use verust_db::models::{Review, ReviewStatus};
use verust_db::queries::reviews::{self, NewReview};
use verust_db::queries::rules as rule_queries;
use verust_db::tasklog::TaskLogStore;

use crate::agent::AgentRegistry;
use crate::config::ReviewSettings;
use crate::dispatch::TaskProcessor;
use crate::notify::{EventType, NotificationEvent, NotificationManager};
use crate::provider::git::GitClient;
use crate::provider::{CloneOptions, ProviderRegistry, split_owner_repo, url_host};
use crate::queue::RepoTaskQueue;
use crate::rules;
use crate::runner::executor::{ExecutionContext, RuleExecutor};
use crate::runner::{ReviewRunner, RunnerResult};
use crate::task::Task;

use workspace::WorkspaceManager;

/// Validation failures surfaced synchronously from [`Engine::submit`].
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("repo_url is required")]
    MissingRepoUrl,

    #[error("unsupported repository URL: {0}")]
    InvalidRepoUrl(String),

    #[error("either a git ref or a pull request number is required")]
    MissingRevision,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Orchestrator composing queue, store, providers, agents and
/// notifications.
pub struct Engine {
    pool: SqlitePool,
    queue: Arc<RepoTaskQueue>,
    providers: Arc<ProviderRegistry>,
    agents: Arc<AgentRegistry>,
    notifier: Arc<NotificationManager>,
    tasklog: Option<TaskLogStore>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(
        pool: SqlitePool,
        queue: Arc<RepoTaskQueue>,
        providers: Arc<ProviderRegistry>,
        agents: Arc<AgentRegistry>,
        notifier: Arc<NotificationManager>,
        tasklog: Option<TaskLogStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            queue,
            providers,
            agents,
            notifier,
            tasklog,
            cancel,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<RepoTaskQueue> {
        &self.queue
    }

    /// Validate and accept a new review: create the review row and its
    /// frozen rule plan (all `pending`), then enqueue the task. Never
    /// blocks on the pipeline.
    pub async fn submit(&self, new: NewReview) -> Result<Review, SubmitError> {
        if new.repo_url.trim().is_empty() {
            return Err(SubmitError::MissingRepoUrl);
        }
        if url_host(&new.repo_url).is_none() || split_owner_repo(&new.repo_url).is_err() {
            return Err(SubmitError::InvalidRepoUrl(new.repo_url.clone()));
        }
        if new.git_ref.trim().is_empty() && new.pr_number.unwrap_or(0) <= 0 {
            return Err(SubmitError::MissingRevision);
        }

        let (plan, source) = rules::resolve_submit_plan(&self.pool, &new.repo_url)
            .await
            .map_err(SubmitError::Internal)?;

        let review = reviews::insert_review(&self.pool, &new)
            .await
            .map_err(SubmitError::Internal)?;
        for row in rules::plan_rows(review.id, &plan).map_err(SubmitError::Internal)? {
            rule_queries::insert_rule(&self.pool, &row)
                .await
                .map_err(SubmitError::Internal)?;
        }

        info!(
            review_id = %review.id,
            repo_url = %review.repo_url,
            rules = plan.rules.len(),
            rule_source = source.as_str(),
            "review submitted"
        );

        if !self.queue.enqueue(Task::from_review(&review)) {
            // Only possible if the same id is already queued, which a
            // fresh v7 id rules out; log and carry on.
            warn!(review_id = %review.id, "freshly created review was already queued");
        }
        Ok(review)
    }

    /// Cancel a review: terminal status plus queue removal. The worker
    /// (if any) observes the status at its next rule boundary; the repo
    /// slot frees immediately.
    pub async fn cancel_review(&self, review_id: Uuid) -> Result<bool> {
        let mut changed = reviews::update_review_status(
            &self.pool,
            review_id,
            ReviewStatus::Pending,
            ReviewStatus::Cancelled,
        )
        .await?
            > 0;
        if !changed {
            changed = reviews::update_review_status(
                &self.pool,
                review_id,
                ReviewStatus::Running,
                ReviewStatus::Cancelled,
            )
            .await?
                > 0;
        }

        let removed = self.queue.remove_task(review_id);
        if changed {
            info!(%review_id, removed_from_queue = removed, "review cancelled");
            let review = reviews::get_review(&self.pool, review_id).await?;
            if let Some(review) = review {
                self.send_notification(
                    NotificationEvent::new(EventType::ReviewCancelled, review_id, review.repo_url),
                )
                .await;
            }
        }
        Ok(changed || removed)
    }

    /// Worker body. Never returns an error to the dispatcher: every
    /// failure is converted into a terminal status on the review.
    pub async fn process_task(&self, task: &Task) {
        let review_id = task.review_id;

        // 1. Re-read; someone else may have finished or cancelled it.
        let review = match reviews::get_review(&self.pool, review_id).await {
            Ok(Some(review)) => review,
            Ok(None) => {
                warn!(%review_id, "task for unknown review, dropping");
                return;
            }
            Err(e) => {
                error!(%review_id, error = %e, "store unavailable, dropping task for recovery");
                return;
            }
        };

        // 2. Own the review: CAS pending -> running. A review already
        // `running` was re-injected by recovery; the queue guarantees we
        // hold its only task, so it is ours to re-drive.
        match review.status {
            ReviewStatus::Pending => {
                match reviews::mark_review_running_if_pending(&self.pool, review_id, Utc::now())
                    .await
                {
                    Ok(1) => {}
                    Ok(_) => {
                        debug!(%review_id, "lost the pending->running race, dropping task");
                        return;
                    }
                    Err(e) => {
                        error!(%review_id, error = %e, "failed to transition review, dropping");
                        return;
                    }
                }
            }
            ReviewStatus::Running => {
                debug!(%review_id, "re-driving recovered running review");
            }
            status => {
                debug!(%review_id, %status, "review already settled, dropping task");
                return;
            }
        }

        let review = match reviews::get_review(&self.pool, review_id).await {
            Ok(Some(review)) => review,
            _ => return,
        };

        self.task_log(review_id, "info", "processing started", serde_json::json!({}))
            .await;

        let outcome = self.execute_review(&review).await;
        self.finalize(&review, outcome).await;
    }

    /// Steps 3-7 of the worker body. Returns the runner verdict, or an
    /// error for anything that must fail the review before/outside the
    /// rule loop (clone, configuration, store).
    async fn execute_review(&self, review: &Review) -> Result<RunnerResult> {
        let settings = ReviewSettings::load(&self.pool)
            .await
            .context("failed to load review settings")?;

        let provider = self.providers.resolve(&review.repo_url)?;

        let manager = WorkspaceManager::new(&settings.workspace);
        let guard = manager.prepare(review.id)?;
        let workdir = guard.path();

        // 3. Clone.
        let pr_number = review.pr_number.unwrap_or(0);
        if pr_number > 0 {
            provider
                .clone_pr(&review.repo_url, workdir, pr_number, &self.cancel)
                .await
                .context("failed to clone pull request")?;
        } else {
            provider
                .clone_repo(
                    &review.repo_url,
                    workdir,
                    &CloneOptions {
                        git_ref: review.git_ref.clone(),
                        depth: 1,
                    },
                    &self.cancel,
                )
                .await
                .context("failed to clone repository")?;
        }
        self.task_log(review.id, "info", "clone finished", serde_json::json!({}))
            .await;

        // 4. Enrich with PR metadata when the webhook left gaps.
        if pr_number > 0 && (review.pr_title.is_none() || review.base_commit_sha.is_none()) {
            match provider.get_pull_request(&review.repo_url, pr_number).await {
                Ok(info) => {
                    reviews::update_pr_metadata(
                        &self.pool,
                        review.id,
                        info.title.as_deref(),
                        info.description.as_deref(),
                        info.author.as_deref(),
                        info.base_sha.as_deref(),
                    )
                    .await?;
                }
                Err(e) => {
                    warn!(review_id = %review.id, error = %e, "failed to enrich PR metadata");
                }
            }
        }

        let review = reviews::get_review(&self.pool, review.id)
            .await?
            .ok_or_else(|| anyhow!("review vanished mid-processing"))?;

        // 5. Diff snapshot and statistics (best effort).
        let git = GitClient::new();
        let (diff_text, changed_files) = self.collect_diff(&git, &review, workdir).await;

        // 6. Rule plan: the in-repo file re-freezes an untouched plan.
        let mut output_language = settings.output_language.clone();
        match rules::load_from_workspace(workdir) {
            Err(e) => return Err(e.context("invalid in-repo rule file")),
            Ok(Some(file)) => {
                if let Some(lang) = &file.output_language {
                    output_language = lang.clone();
                }
                if rule_queries::plan_untouched(&self.pool, review.id).await? {
                    let rows = rules::plan_rows(review.id, &file)?;
                    rule_queries::replace_rules_for_review(&self.pool, review.id, &rows).await?;
                    info!(review_id = %review.id, rules = rows.len(), "rule plan re-frozen from repo file");
                } else {
                    debug!(review_id = %review.id, "plan already touched, keeping frozen rules");
                }
            }
            Ok(None) => {}
        }

        // 7. Drive the rules.
        let runner = ReviewRunner::new(
            self.pool.clone(),
            RuleExecutor::new(self.pool.clone(), Arc::clone(&self.agents)),
        );
        let ctx = ExecutionContext {
            review: &review,
            workspace: workdir,
            diff: &diff_text,
            changed_files: &changed_files,
            output_language: &output_language,
        };
        runner.run(&ctx, &self.cancel).await
    }

    /// Diff text, changed files and stats for `base..head`; falls back to
    /// the HEAD patch when no base SHA is known. Failures downgrade to
    /// warnings -- a review without stats is still reviewable.
    async fn collect_diff(
        &self,
        git: &GitClient,
        review: &Review,
        workdir: &std::path::Path,
    ) -> (String, Vec<String>) {
        let base = review
            .base_commit_sha
            .as_deref()
            .filter(|s| !s.is_empty());

        if let Some(base) = base {
            let head = match git.rev_parse(workdir, "HEAD", &self.cancel).await {
                Ok(sha) => sha,
                Err(e) => {
                    warn!(review_id = %review.id, error = %e, "failed to resolve HEAD");
                    return (String::new(), review.changed_files.0.clone());
                }
            };

            match git.diff_stats(workdir, base, &head, &self.cancel).await {
                Ok(stats) => {
                    if let Err(e) = reviews::update_diff_stats(&self.pool, review.id, &stats).await
                    {
                        warn!(review_id = %review.id, error = %e, "failed to persist diff stats");
                    }
                }
                Err(e) => warn!(review_id = %review.id, error = %e, "failed to compute diff stats"),
            }

            let files = match git.changed_files(workdir, base, &head, &self.cancel).await {
                Ok(files) => {
                    if let Err(e) =
                        reviews::update_changed_files(&self.pool, review.id, &files).await
                    {
                        warn!(review_id = %review.id, error = %e, "failed to persist changed files");
                    }
                    files
                }
                Err(e) => {
                    warn!(review_id = %review.id, error = %e, "failed to list changed files");
                    review.changed_files.0.clone()
                }
            };

            let diff = git
                .diff_text(workdir, base, &head, &self.cancel)
                .await
                .unwrap_or_else(|e| {
                    warn!(review_id = %review.id, error = %e, "failed to collect diff text");
                    String::new()
                });
            (diff, files)
        } else {
            let diff = git.head_patch(workdir, &self.cancel).await.unwrap_or_else(|e| {
                warn!(review_id = %review.id, error = %e, "failed to collect HEAD patch");
                String::new()
            });
            let files = git
                .head_changed_files(workdir, &self.cancel)
                .await
                .unwrap_or_default();
            (diff, files)
        }
    }

    /// Step 8-9: write the terminal status and notify. An interrupted
    /// run (shutdown) leaves the review `running` for recovery.
    async fn finalize(&self, review: &Review, outcome: Result<RunnerResult>) {
        let (status, error) = match outcome {
            Ok(RunnerResult::Interrupted) => {
                info!(review_id = %review.id, "processing interrupted by shutdown");
                return;
            }
            Ok(RunnerResult::Finished { status, error }) => (status, error),
            Err(e) => {
                let message = format!("{e:#}");
                error!(review_id = %review.id, error = %message, "review processing failed");
                (ReviewStatus::Failed, Some(message))
            }
        };

        let completed_at = Utc::now();
        let started_at = review.started_at.unwrap_or(review.created_at);
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0);

        let updated = reviews::finish_review(
            &self.pool,
            review.id,
            status,
            error.as_deref(),
            completed_at,
            duration_ms,
        )
        .await;

        match updated {
            Ok(0) => {
                // Lost to an external transition (cancellation); the
                // cancel path already notified.
                debug!(review_id = %review.id, "finalize lost to an external status change");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!(review_id = %review.id, error = %e, "failed to finalize review");
                return;
            }
        }

        self.task_log(
            review.id,
            "info",
            "processing finished",
            serde_json::json!({"status": status.to_string(), "duration_ms": duration_ms}),
        )
        .await;

        let event_type = match status {
            ReviewStatus::Completed => EventType::ReviewCompleted,
            ReviewStatus::Cancelled => EventType::ReviewCancelled,
            _ => EventType::ReviewFailed,
        };
        self.send_notification(
            NotificationEvent::new(event_type, review.id, review.repo_url.clone())
                .with_error(error),
        )
        .await;
    }

    async fn send_notification(&self, event: NotificationEvent) {
        if let Err(e) = self.notifier.notify(&event).await {
            warn!(review_id = %event.review_id, error = %e, "notification delivery failed");
        }
    }

    /// Best-effort structured log into the task-log store.
    async fn task_log(
        &self,
        review_id: Uuid,
        level: &str,
        message: &str,
        fields: serde_json::Value,
    ) {
        if let Some(store) = &self.tasklog {
            if let Err(e) = store.append(review_id, level, message, fields).await {
                debug!(%review_id, error = %e, "task-log append failed");
            }
        }
    }
}

#[async_trait::async_trait]
impl TaskProcessor for Engine {
    async fn process(&self, task: Task) {
        self.process_task(&task).await;
    }
}
