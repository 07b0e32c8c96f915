use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ReviewStatus {
    /// A terminal review is never picked up by the dispatcher or recovery.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for ReviewStatus {
    type Err = ReviewStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ReviewStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ReviewStatus`] string.
#[derive(Debug, Clone)]
pub struct ReviewStatusParseError(pub String);

impl fmt::Display for ReviewStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid review status: {:?}", self.0)
    }
}

impl std::error::Error for ReviewStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a single rule within a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl RuleStatus {
    /// Rules in these states are not re-executed on a partial re-run.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for RuleStatus {
    type Err = RuleStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(RuleStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RuleStatus`] string.
#[derive(Debug, Clone)]
pub struct RuleStatusParseError(pub String);

impl fmt::Display for RuleStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid rule status: {:?}", self.0)
    }
}

impl std::error::Error for RuleStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of one physical rule execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = RunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(RunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunStatus`] string.
#[derive(Debug, Clone)]
pub struct RunStatusParseError(pub String);

impl fmt::Display for RunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run status: {:?}", self.0)
    }
}

impl std::error::Error for RunStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A review -- one end-to-end code-analysis job.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Review {
    pub id: Uuid,
    pub repo_url: String,
    pub git_ref: String,
    pub commit_sha: String,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    pub base_commit_sha: Option<String>,
    pub pr_title: Option<String>,
    pub pr_description: Option<String>,
    pub changed_files: Json<Vec<String>>,
    pub author: Option<String>,
    pub source: String,
    pub triggered_by: Option<String>,
    pub status: ReviewStatus,
    pub retry_count: i64,
    pub current_rule_index: i64,
    pub error_message: Option<String>,
    pub lines_added: i64,
    pub lines_deleted: i64,
    pub files_changed: i64,
    pub commit_count: i64,
    pub branch_created_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// One rule invocation within a review. `(review_id, rule_index)` is unique;
/// the full set of rows for a review is the frozen execution plan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReviewRule {
    pub id: Uuid,
    pub review_id: Uuid,
    pub rule_index: i64,
    pub rule_id: String,
    pub rule_config: Json<serde_json::Value>,
    pub multi_run_enabled: bool,
    pub multi_run_runs: i64,
    pub status: RuleStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One physical execution of a rule (a rule has several when voting).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReviewRuleRun {
    pub id: Uuid,
    pub rule_row_id: Uuid,
    pub run_index: i64,
    pub agent: String,
    pub model: Option<String>,
    pub prompt: String,
    pub raw_output: Option<String>,
    pub findings_count: i64,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// An issue emitted by an agent for a run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Finding {
    pub id: Uuid,
    pub run_id: Uuid,
    pub category: String,
    pub severity: String,
    pub file: String,
    pub line_start: i64,
    pub line_end: i64,
    pub message: String,
    pub suggestion: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A runtime configuration entry, keyed by (category, key).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Setting {
    pub category: String,
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
