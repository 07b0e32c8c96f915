//! Git-hosting provider adapters.
//!
//! Each provider implements a small capability set: parse a repo URL into
//! (owner, repo), clone a ref, clone a pull request head (fork-aware,
//! via the provider's PR refspec), and fetch PR metadata over the
//! provider's REST API. Adapters live in a name-keyed registry; the URL
//! host picks the adapter.

pub mod git;
pub mod github;
pub mod gitlab;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Pull-request metadata fetched from a provider API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullRequestInfo {
    pub title: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub base_sha: Option<String>,
}

/// Options for cloning a branch or tag.
#[derive(Debug, Clone)]
pub struct CloneOptions {
    pub git_ref: String,
    pub depth: u32,
}

/// Adapter interface for git-hosting providers.
///
/// Object-safe so adapters can be stored as `Arc<dyn Provider>` in the
/// [`ProviderRegistry`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name (e.g. "github").
    fn name(&self) -> &str;

    /// Split a repository URL into (owner, repo).
    fn parse_repo_path(&self, repo_url: &str) -> Result<(String, String)>;

    /// Shallow-clone a ref of the repository into `dest`.
    async fn clone_repo(
        &self,
        repo_url: &str,
        dest: &Path,
        options: &CloneOptions,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Clone the base repository and check out the head of a pull
    /// request by refspec. Works for forks because the head ref lives in
    /// the base repository's ref namespace.
    async fn clone_pr(
        &self,
        repo_url: &str,
        dest: &Path,
        pr_number: i64,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Fetch PR title/description/author/base SHA from the provider API.
    async fn get_pull_request(&self, repo_url: &str, pr_number: i64) -> Result<PullRequestInfo>;
}

// Object safety check.
const _: () = {
    fn _assert_object_safe(_: &dyn Provider) {}
};

/// Extract the host part of a repository URL.
pub fn url_host(repo_url: &str) -> Option<&str> {
    let rest = repo_url
        .strip_prefix("https://")
        .or_else(|| repo_url.strip_prefix("http://"))?;
    let host = rest.split('/').next()?;
    if host.is_empty() { None } else { Some(host) }
}

/// Name-keyed collection of provider adapters, plus the host -> provider
/// mapping used to pick one from a repository URL.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    hosts: HashMap<String, String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Map a URL host to a registered provider name.
    pub fn register_host(&mut self, host: impl Into<String>, provider_name: impl Into<String>) {
        self.hosts.insert(host.into(), provider_name.into());
    }

    /// Look up an adapter by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }

    /// Detect the provider name for a repository URL.
    ///
    /// Explicit host mappings win; otherwise well-known host substrings
    /// are recognised. Returns `None` when nothing matches.
    pub fn detect_from_url(&self, repo_url: &str) -> Option<&str> {
        let host = url_host(repo_url)?;
        if let Some(name) = self.hosts.get(host) {
            return Some(name.as_str());
        }
        if host.contains("github") {
            return self.providers.get("github").map(|p| p.name());
        }
        if host.contains("gitlab") {
            return self.providers.get("gitlab").map(|p| p.name());
        }
        None
    }

    /// Resolve the adapter for a repository URL, or fail with a
    /// configuration error.
    pub fn resolve(&self, repo_url: &str) -> Result<Arc<dyn Provider>> {
        match self.detect_from_url(repo_url) {
            Some(name) => self
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("provider {name} vanished from registry")),
            None => bail!("no git provider configured for {repo_url}"),
        }
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("hosts", &self.hosts)
            .finish()
    }
}

/// Split "scheme://host/owner/repo(.git)" into (owner, repo).
///
/// Shared by the concrete adapters; nested group paths keep everything
/// before the final segment as the owner (GitLab subgroups).
pub fn split_owner_repo(repo_url: &str) -> Result<(String, String)> {
    let rest = repo_url
        .strip_prefix("https://")
        .or_else(|| repo_url.strip_prefix("http://"))
        .ok_or_else(|| anyhow::anyhow!("unsupported repo URL (expected http(s)): {repo_url}"))?;

    let mut segments = rest.split('/');
    let _host = segments.next();
    let parts: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();
    if parts.len() < 2 {
        bail!("repo URL has no owner/repo path: {repo_url}");
    }

    let repo = parts[parts.len() - 1].trim_end_matches(".git");
    let owner = parts[..parts.len() - 1].join("/");
    if owner.is_empty() || repo.is_empty() {
        bail!("repo URL has empty owner or repo: {repo_url}");
    }
    Ok((owner, repo.to_string()))
}
