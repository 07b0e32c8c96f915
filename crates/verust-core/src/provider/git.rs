//! Subprocess git operations shared by the provider adapters.
//!
//! Clones retry on transient failure (network blips, provider rate
//! limits) with doubling backoff. Diff statistics are computed from the
//! cloned workspace with plain git plumbing. Every command honours the
//! cancellation token: the child is killed when the token fires.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use verust_db::queries::reviews::DiffStats;

/// How many times a clone is attempted before the error is terminal.
const CLONE_ATTEMPTS: u32 = 3;
/// Backoff before the second attempt; doubles each retry.
const CLONE_BACKOFF: Duration = Duration::from_secs(2);

/// Thin wrapper over the `git` binary.
#[derive(Debug, Clone, Default)]
pub struct GitClient;

impl GitClient {
    pub fn new() -> Self {
        Self
    }

    /// Run one git command, capturing output. The child is killed if the
    /// cancellation token fires first.
    async fn run(
        &self,
        args: &[&str],
        cwd: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            bail!("git {} cancelled", args.first().unwrap_or(&""));
        }

        let mut cmd = Command::new("git");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        debug!(args = ?args, "running git");
        let output = tokio::select! {
            output = cmd.output() => output.context("failed to run git")?,
            _ = cancel.cancelled() => bail!("git {} cancelled", args.first().unwrap_or(&"")),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "git {} failed ({}): {}",
                args.first().unwrap_or(&""),
                output.status,
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Shallow-clone `git_ref` of `url` into `dest`, retrying transient
    /// failures with doubling backoff.
    pub async fn shallow_clone(
        &self,
        url: &str,
        git_ref: &str,
        dest: &Path,
        depth: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let depth_arg = depth.max(1).to_string();
        let dest_str = dest.to_string_lossy().into_owned();
        let mut args = vec!["clone", "--depth", depth_arg.as_str()];
        if !git_ref.is_empty() {
            args.extend_from_slice(&["--branch", git_ref]);
        }
        args.extend_from_slice(&[url, dest_str.as_str()]);

        self.clone_with_retries(&args, dest, cancel).await
    }

    /// Full clone of `url` into `dest` (pull-request reviews need history
    /// for the base..head range).
    pub async fn full_clone(&self, url: &str, dest: &Path, cancel: &CancellationToken) -> Result<()> {
        let dest_str = dest.to_string_lossy().into_owned();
        let args = vec!["clone", url, dest_str.as_str()];
        self.clone_with_retries(&args, dest, cancel).await
    }

    async fn clone_with_retries(
        &self,
        args: &[&str],
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut backoff = CLONE_BACKOFF;
        let mut last_err = None;

        for attempt in 1..=CLONE_ATTEMPTS {
            match self.run(args, None, cancel).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Err(e);
                    }
                    warn!(attempt, error = %e, "clone attempt failed");
                    // A half-written clone directory poisons the retry.
                    let _ = std::fs::remove_dir_all(dest);
                    last_err = Some(e);
                    if attempt < CLONE_ATTEMPTS {
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => bail!("clone cancelled during backoff"),
                        }
                        backoff *= 2;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("clone failed")))
            .with_context(|| format!("clone failed after {CLONE_ATTEMPTS} attempts"))
    }

    /// Fetch a refspec into an existing clone and check out FETCH_HEAD.
    pub async fn fetch_and_checkout(
        &self,
        workdir: &Path,
        refspec: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run(&["fetch", "origin", refspec], Some(workdir), cancel)
            .await
            .with_context(|| format!("failed to fetch {refspec}"))?;
        self.run(&["checkout", "--detach", "FETCH_HEAD"], Some(workdir), cancel)
            .await
            .context("failed to check out FETCH_HEAD")?;
        Ok(())
    }

    /// Resolve a revision to a commit SHA.
    pub async fn rev_parse(
        &self,
        workdir: &Path,
        rev: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let out = self.run(&["rev-parse", rev], Some(workdir), cancel).await?;
        Ok(out.trim().to_string())
    }

    /// Changed file paths in `base..head`.
    pub async fn changed_files(
        &self,
        workdir: &Path,
        base: &str,
        head: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let range = format!("{base}..{head}");
        let out = self
            .run(&["diff", "--name-only", &range], Some(workdir), cancel)
            .await?;
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Unified diff text for `base..head`, used in rule prompts.
    pub async fn diff_text(
        &self,
        workdir: &Path,
        base: &str,
        head: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let range = format!("{base}..{head}");
        self.run(&["diff", &range], Some(workdir), cancel).await
    }

    /// Patch text of the HEAD commit. Fallback for reviews without a
    /// base SHA (shallow branch clones have no range to diff).
    pub async fn head_patch(&self, workdir: &Path, cancel: &CancellationToken) -> Result<String> {
        self.run(&["show", "--format=", "HEAD"], Some(workdir), cancel)
            .await
    }

    /// Files touched by the HEAD commit.
    pub async fn head_changed_files(
        &self,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let out = self
            .run(
                &["show", "--name-only", "--format=", "HEAD"],
                Some(workdir),
                cancel,
            )
            .await?;
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Diff statistics for `base..head`: numstat totals, commit count,
    /// and the author time of the first commit in the range.
    pub async fn diff_stats(
        &self,
        workdir: &Path,
        base: &str,
        head: &str,
        cancel: &CancellationToken,
    ) -> Result<DiffStats> {
        let range = format!("{base}..{head}");

        let numstat = self
            .run(&["diff", "--numstat", &range], Some(workdir), cancel)
            .await?;
        let mut stats = parse_numstat(&numstat);

        let count = self
            .run(&["rev-list", "--count", &range], Some(workdir), cancel)
            .await?;
        stats.commit_count = count.trim().parse().unwrap_or(0);

        let first = self
            .run(
                &["log", "--reverse", "--format=%aI", &range],
                Some(workdir),
                cancel,
            )
            .await?;
        stats.branch_created_at = first
            .lines()
            .next()
            .and_then(|line| DateTime::parse_from_rfc3339(line.trim()).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(stats)
    }
}

/// Parse `git diff --numstat` output: `added\tdeleted\tpath` per line,
/// with `-` for binary files.
fn parse_numstat(raw: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in raw.lines() {
        let mut parts = line.split('\t');
        let added = parts.next().unwrap_or("-");
        let deleted = parts.next().unwrap_or("-");
        if parts.next().is_none() {
            continue;
        }
        stats.files_changed += 1;
        stats.lines_added += added.parse::<i64>().unwrap_or(0);
        stats.lines_deleted += deleted.parse::<i64>().unwrap_or(0);
    }
    stats
}
