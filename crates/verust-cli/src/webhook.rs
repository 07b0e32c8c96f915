//! Webhook signature verification and payload mapping.
//!
//! GitHub signs the raw body with HMAC-SHA256 (`X-Hub-Signature-256:
//! sha256=<hex>`); GitLab sends the shared secret verbatim in
//! `X-Gitlab-Token`. Both checks are constant-time. Parsed payloads map
//! onto [`NewReview`]; events the orchestrator does not act on map to
//! `None` and are acknowledged without side effects.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use verust_db::queries::reviews::NewReview;

type HmacSha256 = Hmac<Sha256>;

/// Why a webhook request was rejected.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("invalid signature format: {0}")]
    InvalidFormat(String),

    #[error("signature verification failed")]
    SignatureMismatch,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Verify a GitHub `X-Hub-Signature-256` header against the raw body.
pub fn verify_github_signature(
    secret: &str,
    body: &[u8],
    header: Option<&str>,
) -> Result<(), WebhookError> {
    let header = header.ok_or(WebhookError::MissingSignature)?;
    let hex_sig = header
        .strip_prefix("sha256=")
        .ok_or_else(|| WebhookError::InvalidFormat("expected sha256= prefix".to_string()))?;
    let provided = hex::decode(hex_sig)
        .map_err(|e| WebhookError::InvalidFormat(format!("invalid hex: {e}")))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::InvalidFormat(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| WebhookError::SignatureMismatch)
}

/// Verify a GitLab `X-Gitlab-Token` header (constant-time equality).
pub fn verify_gitlab_token(secret: &str, header: Option<&str>) -> Result<(), WebhookError> {
    let header = header.ok_or(WebhookError::MissingSignature)?;
    if constant_time_eq(secret.as_bytes(), header.as_bytes()) {
        Ok(())
    } else {
        Err(WebhookError::SignatureMismatch)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ---------------------------------------------------------------------------
// GitHub payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GithubRepository {
    clone_url: String,
}

#[derive(Debug, Deserialize)]
struct GithubPushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    repository: GithubRepository,
    #[serde(default)]
    pusher: Option<GithubPusher>,
}

#[derive(Debug, Deserialize)]
struct GithubPusher {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GithubPullRequestPayload {
    action: String,
    number: i64,
    repository: GithubRepository,
    pull_request: GithubPullRequest,
}

#[derive(Debug, Deserialize)]
struct GithubPullRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    user: Option<GithubUser>,
    head: GithubRefPointer,
    base: GithubRefPointer,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GithubRefPointer {
    sha: String,
}

/// PR actions that trigger a review.
const GITHUB_PR_ACTIONS: &[&str] = &["opened", "synchronize", "reopened", "ready_for_review"];

/// Map a GitHub event (named by `X-GitHub-Event`) to a review request.
pub fn map_github_event(event: &str, body: &[u8]) -> Result<Option<NewReview>, WebhookError> {
    match event {
        "push" => {
            let payload: GithubPushPayload = serde_json::from_slice(body)
                .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
            // Deleted branches push an all-zero head.
            if payload.after.chars().all(|c| c == '0') {
                return Ok(None);
            }
            let branch = payload
                .git_ref
                .strip_prefix("refs/heads/")
                .or_else(|| payload.git_ref.strip_prefix("refs/tags/"))
                .unwrap_or(&payload.git_ref)
                .to_string();
            Ok(Some(NewReview {
                repo_url: payload.repository.clone_url,
                git_ref: branch,
                commit_sha: payload.after,
                source: "webhook".to_string(),
                triggered_by: payload.pusher.map(|p| p.name),
                ..Default::default()
            }))
        }
        "pull_request" => {
            let payload: GithubPullRequestPayload = serde_json::from_slice(body)
                .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
            if !GITHUB_PR_ACTIONS.contains(&payload.action.as_str()) {
                return Ok(None);
            }
            let pr = payload.pull_request;
            Ok(Some(NewReview {
                repo_url: payload.repository.clone_url,
                git_ref: String::new(),
                commit_sha: pr.head.sha,
                pr_number: Some(payload.number),
                pr_url: pr.html_url,
                base_commit_sha: Some(pr.base.sha),
                pr_title: pr.title,
                pr_description: pr.body,
                author: pr.user.map(|u| u.login),
                source: "webhook".to_string(),
                ..Default::default()
            }))
        }
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// GitLab payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GitlabProject {
    git_http_url: String,
}

#[derive(Debug, Deserialize)]
struct GitlabPushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    #[serde(default)]
    checkout_sha: Option<String>,
    project: GitlabProject,
    #[serde(default)]
    user_username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitlabMergeRequestPayload {
    project: GitlabProject,
    object_attributes: GitlabMergeRequestAttributes,
    #[serde(default)]
    user: Option<GitlabUser>,
}

#[derive(Debug, Deserialize)]
struct GitlabUser {
    username: String,
}

#[derive(Debug, Deserialize)]
struct GitlabMergeRequestAttributes {
    iid: i64,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    last_commit: Option<GitlabCommit>,
}

#[derive(Debug, Deserialize)]
struct GitlabCommit {
    id: String,
}

const GITLAB_MR_ACTIONS: &[&str] = &["open", "update", "reopen"];

/// Map a GitLab event (named by `X-Gitlab-Event` / `object_kind`).
pub fn map_gitlab_event(event: &str, body: &[u8]) -> Result<Option<NewReview>, WebhookError> {
    match event {
        "Push Hook" | "push" => {
            let payload: GitlabPushPayload = serde_json::from_slice(body)
                .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
            let Some(sha) = payload.checkout_sha else {
                return Ok(None); // branch deletion
            };
            let branch = payload
                .git_ref
                .strip_prefix("refs/heads/")
                .or_else(|| payload.git_ref.strip_prefix("refs/tags/"))
                .unwrap_or(&payload.git_ref)
                .to_string();
            Ok(Some(NewReview {
                repo_url: payload.project.git_http_url,
                git_ref: branch,
                commit_sha: sha,
                source: "webhook".to_string(),
                triggered_by: payload.user_username,
                ..Default::default()
            }))
        }
        "Merge Request Hook" | "merge_request" => {
            let payload: GitlabMergeRequestPayload = serde_json::from_slice(body)
                .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
            let attrs = payload.object_attributes;
            if let Some(action) = &attrs.action {
                if !GITLAB_MR_ACTIONS.contains(&action.as_str()) {
                    return Ok(None);
                }
            }
            Ok(Some(NewReview {
                repo_url: payload.project.git_http_url,
                git_ref: String::new(),
                commit_sha: attrs.last_commit.map(|c| c.id).unwrap_or_default(),
                pr_number: Some(attrs.iid),
                pr_url: attrs.url,
                pr_title: attrs.title,
                pr_description: attrs.description,
                author: payload.user.map(|u| u.username),
                source: "webhook".to_string(),
                ..Default::default()
            }))
        }
        _ => Ok(None),
    }
}
