//! Shared fixtures for the pipeline integration tests: an in-memory stub
//! provider, a scriptable stub agent, and an environment builder that
//! wires a full engine against a temporary database.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use verust_core::agent::{Agent, AgentError, AgentInvocation, AgentRegistry, AgentRequest};
use verust_core::dispatch::{Dispatcher, DispatcherConfig, TaskProcessor};
use verust_core::engine::Engine;
use verust_core::notify::NotificationManager;
use verust_core::provider::{CloneOptions, Provider, ProviderRegistry, PullRequestInfo};
use verust_core::queue::RepoTaskQueue;
use verust_db::models::{Review, ReviewStatus};
use verust_db::queries::reviews::{self, NewReview};
use verust_db::queries::settings::set_setting;
use verust_test_utils::create_test_db;

// ---------------------------------------------------------------------------
// Stub provider
// ---------------------------------------------------------------------------

/// Provider that fabricates a workspace instead of cloning. Records the
/// review ids it "cloned" (parsed from the destination directory name)
/// and optionally seeds a rule file into the checkout.
#[derive(Default)]
pub struct StubProvider {
    pub clones: Mutex<Vec<Uuid>>,
    rules_file: Mutex<Option<String>>,
}

impl StubProvider {
    /// Make every subsequent "clone" contain this `.verust-review.yaml`.
    pub fn set_rules_file(&self, content: &str) {
        *self.rules_file.lock().unwrap() = Some(content.to_string());
    }

    fn record(&self, dest: &Path) {
        if let Some(id) = dest
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            self.clones.lock().unwrap().push(id);
        }
        if let Some(content) = self.rules_file.lock().unwrap().as_deref() {
            std::fs::write(dest.join(".verust-review.yaml"), content).unwrap();
        }
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    fn parse_repo_path(&self, repo_url: &str) -> Result<(String, String)> {
        verust_core::provider::split_owner_repo(repo_url)
    }

    async fn clone_repo(
        &self,
        _repo_url: &str,
        dest: &Path,
        _options: &CloneOptions,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("README.md"), "stub checkout\n")?;
        self.record(dest);
        Ok(())
    }

    async fn clone_pr(
        &self,
        _repo_url: &str,
        dest: &Path,
        _pr_number: i64,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("README.md"), "stub pr checkout\n")?;
        self.record(dest);
        Ok(())
    }

    async fn get_pull_request(&self, _repo_url: &str, _pr_number: i64) -> Result<PullRequestInfo> {
        Ok(PullRequestInfo {
            title: Some("Stub PR".to_string()),
            description: Some("Stubbed description".to_string()),
            author: Some("stub-author".to_string()),
            base_sha: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Stub agent
// ---------------------------------------------------------------------------

/// What one stub invocation should do.
#[derive(Debug, Clone)]
pub enum RunBehavior {
    /// Succeed after `delay`, emitting `findings` findings.
    Succeed { findings: usize, delay: Duration },
    /// Fail with a non-transport agent error.
    Fail { message: String },
}

impl RunBehavior {
    pub fn quick_success(findings: usize) -> Self {
        Self::Succeed {
            findings,
            delay: Duration::from_millis(0),
        }
    }
}

/// Scriptable agent: consumes behaviors from a queue, falling back to a
/// default. Tracks invocation count and peak concurrency.
pub struct StubAgent {
    script: Mutex<VecDeque<RunBehavior>>,
    default: RunBehavior,
    pub invocations: AtomicUsize,
    active: AtomicUsize,
    pub peak_active: AtomicUsize,
}

impl StubAgent {
    pub fn with_default(default: RunBehavior) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default,
            invocations: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
        }
    }

    pub fn push_behavior(&self, behavior: RunBehavior) {
        self.script.lock().unwrap().push_back(behavior);
    }

    fn findings_block(count: usize) -> String {
        let findings: Vec<serde_json::Value> = (0..count)
            .map(|i| {
                serde_json::json!({
                    "category": "style",
                    "severity": "minor",
                    "file": format!("src/file_{i}.rs"),
                    "line_start": i + 1,
                    "line_end": i + 1,
                    "message": format!("stub finding {i}"),
                })
            })
            .collect();
        format!(
            "Reviewed the change.\n```json\n{}\n```\n",
            serde_json::json!({ "findings": findings })
        )
    }
}

#[async_trait]
impl Agent for StubAgent {
    fn name(&self) -> &str {
        "stub"
    }

    fn supports(&self, _model: &str) -> bool {
        true
    }

    async fn invoke(
        &self,
        _request: &AgentRequest,
        cancel: &CancellationToken,
    ) -> Result<AgentInvocation, AgentError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);

        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        let result = match behavior {
            RunBehavior::Succeed { findings, delay } => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(AgentInvocation {
                        raw_output: Self::findings_block(findings),
                        stderr: String::new(),
                        duration: delay,
                    }),
                    _ = cancel.cancelled() => Err(AgentError::Cancelled),
                }
            }
            RunBehavior::Fail { message } => Err(AgentError::Failed {
                code: Some(1),
                stderr: message,
            }),
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

pub struct TestEnv {
    pub pool: SqlitePool,
    pub dir: TempDir,
    pub queue: Arc<RepoTaskQueue>,
    pub engine: Arc<Engine>,
    pub agent: Arc<StubAgent>,
    pub provider: Arc<StubProvider>,
    pub cancel: CancellationToken,
    ready_rx: Option<mpsc::Receiver<()>>,
    dispatcher: Option<Dispatcher>,
}

impl TestEnv {
    /// Build the full wiring (engine, queue, registries, stub backends)
    /// against a fresh migrated database. The dispatcher is not started
    /// yet so tests can seed store state first.
    pub async fn new(agent: StubAgent) -> Self {
        let (pool, dir) = create_test_db().await;

        set_setting(
            &pool,
            "review",
            "workspace",
            &serde_json::json!(dir.path().join("workspace")),
        )
        .await
        .unwrap();
        set_setting(
            &pool,
            "rules",
            "default",
            &serde_json::json!({ "rules": [ { "id": "style" } ] }),
        )
        .await
        .unwrap();

        let provider = Arc::new(StubProvider::default());
        let mut providers = ProviderRegistry::new();
        providers.register(provider.clone() as Arc<dyn Provider>);
        providers.register_host("example.com", "stub");

        let agent = Arc::new(agent);
        let mut agents = AgentRegistry::new();
        agents.register(agent.clone() as Arc<dyn Agent>);

        let (queue, ready_rx) = RepoTaskQueue::new();
        let queue = Arc::new(queue);
        let cancel = CancellationToken::new();

        let engine = Arc::new(Engine::new(
            pool.clone(),
            Arc::clone(&queue),
            Arc::new(providers),
            Arc::new(agents),
            Arc::new(NotificationManager::new(pool.clone())),
            None,
            cancel.clone(),
        ));

        Self {
            pool,
            dir,
            queue,
            engine,
            agent,
            provider,
            cancel,
            ready_rx: Some(ready_rx),
            dispatcher: None,
        }
    }

    /// Start the dispatcher with `workers` parallel workers.
    pub fn start(&mut self, workers: usize) {
        let ready_rx = self.ready_rx.take().expect("dispatcher already started");
        let dispatcher = Dispatcher::start(
            Arc::clone(&self.queue),
            ready_rx,
            Arc::clone(&self.engine) as Arc<dyn TaskProcessor>,
            DispatcherConfig {
                workers,
                shutdown_grace: Duration::from_secs(2),
            },
            self.cancel.clone(),
        );
        self.dispatcher = Some(dispatcher);
    }

    pub async fn shutdown(mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown().await;
        }
    }

    /// Submit a review for `repo_url` on `main`.
    pub async fn submit(&self, repo_url: &str) -> Review {
        self.engine
            .submit(NewReview {
                repo_url: repo_url.to_string(),
                git_ref: "main".to_string(),
                commit_sha: String::new(),
                source: "test".to_string(),
                ..Default::default()
            })
            .await
            .expect("submit should succeed")
    }

    /// Poll until the review reaches `status` (or panic after `timeout`).
    pub async fn wait_for_status(
        &self,
        review_id: Uuid,
        status: ReviewStatus,
        timeout: Duration,
    ) -> Review {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let review = reviews::get_review(&self.pool, review_id)
                .await
                .unwrap()
                .expect("review should exist");
            if review.status == status {
                return review;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "review {review_id} stuck in {}, wanted {status}",
                    review.status
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the queue is fully idle (no pending, no running).
    pub async fn wait_for_idle(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let stats = self.queue.stats();
            if stats.pending_total == 0 && stats.running_repos == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("queue never went idle: {stats:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
