//! Declarative review rules.
//!
//! A rule names a prompt template, the agents allowed to run it (in
//! preference order), and the multi-run/vote settings. The plan for a
//! review resolves with priority:
//!
//! 1. `.verust-review.yaml` at the cloned repo root
//! 2. repo-specific rule set from the settings store (`rules` category,
//!    key `repo:<url>`)
//! 3. the store-wide default (`rules` category, key `default`)
//! 4. the built-in system default
//!
//! Each rule row snapshots its resolved [`RuleConfig`] as JSON, so later
//! config edits never change a frozen plan.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use verust_db::queries::rules::NewReviewRule;
use verust_db::queries::settings;

/// File name probed at the repo root after clone.
pub const REPO_RULES_FILE: &str = ".verust-review.yaml";

const RULES_CATEGORY: &str = "rules";
const DEFAULT_KEY: &str = "default";

/// Multi-run / voting settings for one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiRunConfig {
    pub enabled: bool,
    pub runs: i64,
    /// Override for the vote quorum; clamped to `1..=runs` when applied.
    pub vote_threshold: Option<i64>,
}

impl Default for MultiRunConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            runs: 1,
            vote_threshold: None,
        }
    }
}

/// One declarative review rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule name, unique within a rule set (e.g. "style", "security").
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Prompt template; `{{placeholder}}` markers are substituted at
    /// execution time (see the runner's prompt module).
    #[serde(default)]
    pub prompt: Option<String>,
    /// Agent preference order; empty means "any configured agent".
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub multi_run: MultiRunConfig,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RuleConfig {
    /// Number of physical executions this rule performs.
    pub fn effective_runs(&self) -> i64 {
        if self.multi_run.enabled {
            self.multi_run.runs.max(1)
        } else {
            1
        }
    }

    /// Vote quorum for multi-run aggregation: the configured override
    /// clamped to `1..=runs`, or a simple majority.
    pub fn vote_quorum(&self) -> i64 {
        let runs = self.effective_runs();
        match self.multi_run.vote_threshold {
            Some(t) => t.clamp(1, runs),
            None => (runs + 1) / 2,
        }
    }

    /// Rebuild a rule config from the JSON snapshot frozen on a rule row.
    pub fn from_snapshot(snapshot: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(snapshot.clone()).context("malformed rule config snapshot")
    }
}

/// A full rule set, as stored or as read from the repo file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub output_language: Option<String>,
}

/// Where a resolved plan came from (logged with the review).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSource {
    RepoFile,
    StoreRepo,
    StoreDefault,
    SystemDefault,
}

impl RuleSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RepoFile => "repo_file",
            Self::StoreRepo => "store_repo",
            Self::StoreDefault => "store_default",
            Self::SystemDefault => "system_default",
        }
    }
}

/// The built-in fallback rule set: one general review rule.
pub fn system_default() -> RulesFile {
    RulesFile {
        rules: vec![RuleConfig {
            id: "general-review".to_string(),
            description: Some("General code review of the change set".to_string()),
            prompt: None,
            agents: Vec::new(),
            multi_run: MultiRunConfig::default(),
            enabled: true,
        }],
        output_language: None,
    }
}

/// Read the rule file from a cloned workspace, if present.
///
/// A present-but-malformed file is a configuration error (the review
/// fails before the first rule runs) rather than a silent fallback.
pub fn load_from_workspace(workspace: &Path) -> Result<Option<RulesFile>> {
    let path = workspace.join(REPO_RULES_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file: RulesFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("malformed rule file {}", path.display()))?;
    Ok(Some(file))
}

/// Load the repo-specific rule set from the settings store.
pub async fn load_repo_rules(pool: &SqlitePool, repo_url: &str) -> Result<Option<RulesFile>> {
    let key = format!("repo:{repo_url}");
    match settings::get_setting(pool, RULES_CATEGORY, &key).await? {
        None => Ok(None),
        Some(value) => {
            let file = serde_json::from_value(value)
                .with_context(|| format!("malformed stored rule set for {repo_url}"))?;
            Ok(Some(file))
        }
    }
}

/// Load the store-wide default rule set.
pub async fn load_default_rules(pool: &SqlitePool) -> Result<Option<RulesFile>> {
    match settings::get_setting(pool, RULES_CATEGORY, DEFAULT_KEY).await? {
        None => Ok(None),
        Some(value) => {
            let file =
                serde_json::from_value(value).context("malformed stored default rule set")?;
            Ok(Some(file))
        }
    }
}

/// Resolve the rule set used at submit time (store repo > store default >
/// system default). The repo file cannot participate yet because nothing
/// has been cloned.
pub async fn resolve_submit_plan(
    pool: &SqlitePool,
    repo_url: &str,
) -> Result<(RulesFile, RuleSource)> {
    if let Some(file) = load_repo_rules(pool, repo_url).await? {
        return Ok((file, RuleSource::StoreRepo));
    }
    if let Some(file) = load_default_rules(pool).await? {
        return Ok((file, RuleSource::StoreDefault));
    }
    Ok((system_default(), RuleSource::SystemDefault))
}

/// Enabled rules of a set, in file order.
pub fn enabled_rules(file: &RulesFile) -> Vec<&RuleConfig> {
    file.rules.iter().filter(|r| r.enabled).collect()
}

/// Convert a rule set into insertable plan rows for a review.
pub fn plan_rows(review_id: Uuid, file: &RulesFile) -> Result<Vec<NewReviewRule>> {
    let mut rows = Vec::new();
    for (index, rule) in enabled_rules(file).into_iter().enumerate() {
        let snapshot =
            serde_json::to_value(rule).context("failed to serialize rule config snapshot")?;
        rows.push(NewReviewRule {
            review_id,
            rule_index: index as i64,
            rule_id: rule.id.clone(),
            rule_config: snapshot,
            multi_run_enabled: rule.multi_run.enabled,
            multi_run_runs: rule.effective_runs(),
        });
    }
    Ok(rows)
}
