//! Findings extraction from agent output, and the multi-run vote.
//!
//! Agents are asked to emit a fenced ```json block with a top-level
//! `findings` array. Parsing is tolerant: the last parseable block wins,
//! a bare JSON object is accepted, and a missing block means zero
//! findings rather than an error (an agent is allowed to find nothing).

use serde::Deserialize;

use verust_db::queries::findings::NewFinding;

#[derive(Debug, Deserialize)]
struct FindingsBlock {
    findings: Vec<RawFinding>,
}

#[derive(Debug, Deserialize)]
struct RawFinding {
    #[serde(default)]
    category: String,
    #[serde(default = "default_severity")]
    severity: String,
    #[serde(default)]
    file: String,
    /// Single-line shorthand; used for both ends when start/end absent.
    #[serde(default)]
    line: Option<i64>,
    #[serde(default)]
    line_start: Option<i64>,
    #[serde(default)]
    line_end: Option<i64>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    suggestion: Option<String>,
}

fn default_severity() -> String {
    "info".to_string()
}

impl RawFinding {
    fn into_new_finding(self) -> NewFinding {
        let line_start = self.line_start.or(self.line).unwrap_or(0);
        let line_end = self.line_end.or(self.line).unwrap_or(line_start).max(line_start);
        NewFinding {
            category: self.category,
            severity: self.severity,
            file: self.file,
            line_start,
            line_end,
            message: self.message,
            suggestion: self.suggestion,
        }
    }
}

/// Extract findings from raw agent output.
pub fn parse_findings(raw_output: &str) -> Vec<NewFinding> {
    // Last parseable fenced block wins: agents often think aloud in an
    // earlier block and emit the final answer at the end.
    for block in fenced_json_blocks(raw_output).into_iter().rev() {
        if let Ok(parsed) = serde_json::from_str::<FindingsBlock>(&block) {
            return parsed
                .findings
                .into_iter()
                .map(RawFinding::into_new_finding)
                .collect();
        }
    }

    // Fall back to treating the whole output as one JSON object.
    if let Ok(parsed) = serde_json::from_str::<FindingsBlock>(raw_output.trim()) {
        return parsed
            .findings
            .into_iter()
            .map(RawFinding::into_new_finding)
            .collect();
    }

    Vec::new()
}

/// Collect the contents of ```json (or bare ```) fenced blocks.
fn fenced_json_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        match &mut current {
            None => {
                if trimmed == "```json" || trimmed == "```" {
                    current = Some(String::new());
                }
            }
            Some(buf) => {
                if trimmed == "```" {
                    blocks.push(std::mem::take(buf));
                    current = None;
                } else {
                    buf.push_str(line);
                    buf.push('\n');
                }
            }
        }
    }
    blocks
}

/// Identity of a finding for de-duplication: file, line range, category,
/// and the normalized message.
pub fn dedup_key(finding: &NewFinding) -> (String, i64, i64, String, String) {
    (
        finding.file.clone(),
        finding.line_start,
        finding.line_end,
        finding.category.clone(),
        normalize_message(&finding.message),
    )
}

/// Lowercase and collapse runs of whitespace, so cosmetic rephrasings of
/// the same message de-duplicate.
pub fn normalize_message(message: &str) -> String {
    message
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Majority vote across the runs of one rule.
///
/// A finding is kept when it appears (by [`dedup_key`]) in at least
/// `quorum` runs; duplicates within a single run count once. The first
/// occurrence wins for the persisted text; output order follows first
/// appearance across runs.
pub fn majority_vote(per_run: &[Vec<NewFinding>], quorum: i64) -> Vec<NewFinding> {
    use std::collections::HashMap;

    let quorum = quorum.max(1) as usize;
    let mut counts: HashMap<(String, i64, i64, String, String), usize> = HashMap::new();
    let mut order: Vec<((String, i64, i64, String, String), NewFinding)> = Vec::new();

    for run in per_run {
        let mut seen_this_run = std::collections::HashSet::new();
        for finding in run {
            let key = dedup_key(finding);
            if !seen_this_run.insert(key.clone()) {
                continue;
            }
            let count = counts.entry(key.clone()).or_insert(0);
            if *count == 0 {
                order.push((key, finding.clone()));
            }
            *count += 1;
        }
    }

    order
        .into_iter()
        .filter(|(key, _)| counts.get(key).copied().unwrap_or(0) >= quorum)
        .map(|(_, finding)| finding)
        .collect()
}
