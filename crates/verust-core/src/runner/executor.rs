//! Rule execution: one rule, `R` physical runs, agent failover, voting.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use verust_db::models::{Review, ReviewRule, RunStatus};
use verust_db::queries::findings::{self, NewFinding};
use verust_db::queries::runs::{self, NewRun, RunOutcome};

use crate::agent::{AgentRegistry, AgentRequest};
use crate::rules::RuleConfig;

use super::parse::{majority_vote, parse_findings};
use super::prompt::{PromptContext, build_prompt};

/// Review-wide context shared by every rule of one review.
#[derive(Debug)]
pub struct ExecutionContext<'a> {
    pub review: &'a Review,
    pub workspace: &'a Path,
    pub diff: &'a str,
    pub changed_files: &'a [String],
    pub output_language: &'a str,
}

/// Result of executing one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    /// Enough runs completed; `findings` is the post-vote count.
    Completed { findings: usize },
    /// The rule could not produce a quorum of completed runs.
    Failed { error: String },
    /// Cancellation was observed before the rule finished.
    Cancelled,
}

/// Executes single rules against a cloned workspace.
pub struct RuleExecutor {
    pool: SqlitePool,
    agents: Arc<AgentRegistry>,
}

impl RuleExecutor {
    pub fn new(pool: SqlitePool, agents: Arc<AgentRegistry>) -> Self {
        Self { pool, agents }
    }

    /// Run one rule: `R = effective_runs` independent invocations, agent
    /// failover on transport errors, findings persisted per run, and a
    /// majority vote across runs when `R > 1`.
    ///
    /// Each run gets a fresh agent timeout, so the rule's wall-time bound
    /// is `R x agent.timeout`.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        rule_row: &ReviewRule,
        cancel: &CancellationToken,
    ) -> Result<RuleOutcome> {
        let rule = match RuleConfig::from_snapshot(&rule_row.rule_config.0) {
            Ok(rule) => rule,
            Err(e) => {
                return Ok(RuleOutcome::Failed {
                    error: format!("invalid rule config: {e:#}"),
                });
            }
        };

        let preference: Vec<String> = if rule.agents.is_empty() {
            self.agents.list().iter().map(|s| s.to_string()).collect()
        } else {
            rule.agents.clone()
        };
        if preference.is_empty() {
            return Ok(RuleOutcome::Failed {
                error: "no agents configured".to_string(),
            });
        }

        let prompt = build_prompt(&PromptContext {
            review: ctx.review,
            rule: &rule,
            diff: ctx.diff,
            changed_files: ctx.changed_files,
            output_language: ctx.output_language,
        });

        let total_runs = rule.effective_runs();
        let mut per_run_findings: Vec<Vec<NewFinding>> = Vec::new();
        let mut completed_runs: i64 = 0;
        let mut first_error: Option<String> = None;

        for run_index in 0..total_runs {
            if cancel.is_cancelled() {
                return Ok(RuleOutcome::Cancelled);
            }

            match self
                .run_once(rule_row, &preference, &prompt, ctx.workspace, run_index, cancel)
                .await?
            {
                Ok(run_findings) => {
                    completed_runs += 1;
                    per_run_findings.push(run_findings);
                }
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        let quorum = if total_runs > 1 { rule.vote_quorum() } else { 1 };
        if completed_runs < quorum {
            return Ok(RuleOutcome::Failed {
                error: first_error.unwrap_or_else(|| {
                    format!("only {completed_runs}/{total_runs} runs completed (quorum {quorum})")
                }),
            });
        }

        let aggregated = if total_runs > 1 {
            majority_vote(&per_run_findings, quorum)
        } else {
            per_run_findings.pop().unwrap_or_default()
        };

        info!(
            rule_id = %rule_row.rule_id,
            runs = total_runs,
            findings = aggregated.len(),
            "rule completed"
        );
        Ok(RuleOutcome::Completed {
            findings: aggregated.len(),
        })
    }

    /// One physical run: walk the agent preference list, failing over to
    /// the next agent on transport errors only. Every attempt gets its
    /// own run row; a transport-dead agent's row is finished as `failed`
    /// before the next agent is tried.
    ///
    /// Returns `Ok(Ok(findings))` when an agent answered, `Ok(Err(msg))`
    /// when this run is exhausted.
    async fn run_once(
        &self,
        rule_row: &ReviewRule,
        preference: &[String],
        prompt: &str,
        workspace: &Path,
        run_index: i64,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<Vec<NewFinding>, String>> {
        let mut last_error = String::from("no usable agent");

        for agent_name in preference {
            let Some(agent) = self.agents.get(agent_name) else {
                warn!(agent = %agent_name, "agent not in registry, skipping");
                last_error = format!("unknown agent '{agent_name}'");
                continue;
            };

            let run = runs::insert_run(
                &self.pool,
                &NewRun {
                    rule_row_id: rule_row.id,
                    run_index,
                    agent: agent_name.clone(),
                    model: None,
                    prompt: prompt.to_string(),
                },
            )
            .await?;
            runs::mark_run_running(&self.pool, run.id, Utc::now()).await?;

            let request = AgentRequest {
                prompt: prompt.to_string(),
                workspace: workspace.to_path_buf(),
                timeout: agent.default_timeout(),
                model: None,
            };

            match agent.invoke(&request, cancel).await {
                Ok(invocation) => {
                    let run_findings = parse_findings(&invocation.raw_output);
                    findings::insert_findings(&self.pool, run.id, &run_findings).await?;
                    runs::finish_run(
                        &self.pool,
                        run.id,
                        RunStatus::Completed,
                        &RunOutcome {
                            raw_output: Some(invocation.raw_output),
                            findings_count: run_findings.len() as i64,
                            duration_ms: invocation.duration.as_millis() as i64,
                            error_message: None,
                        },
                    )
                    .await?;
                    return Ok(Ok(run_findings));
                }
                Err(error) => {
                    let message = error.to_string();
                    runs::finish_run(
                        &self.pool,
                        run.id,
                        RunStatus::Failed,
                        &RunOutcome {
                            error_message: Some(message.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;

                    if error.is_transport() {
                        warn!(
                            agent = %agent_name,
                            error = %message,
                            "agent transport error, failing over"
                        );
                        last_error = message;
                        continue;
                    }
                    return Ok(Err(message));
                }
            }
        }

        Ok(Err(last_error))
    }
}
