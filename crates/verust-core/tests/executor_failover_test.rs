//! RuleExecutor behaviors that need fine-grained agent control: failover
//! across the preference list on transport errors, and timeout handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use verust_core::agent::{Agent, AgentError, AgentInvocation, AgentRegistry, AgentRequest};
use verust_core::runner::executor::{ExecutionContext, RuleExecutor, RuleOutcome};
use verust_db::models::RunStatus;
use verust_db::queries::rules::{self, NewReviewRule};
use verust_db::queries::runs;
use verust_test_utils::{create_test_db, insert_test_review};

/// Agent whose every invocation yields the same error kind.
struct BrokenAgent {
    agent_name: &'static str,
    error: fn() -> AgentError,
    pub calls: AtomicUsize,
}

#[async_trait]
impl Agent for BrokenAgent {
    fn name(&self) -> &str {
        self.agent_name
    }

    fn supports(&self, _model: &str) -> bool {
        true
    }

    async fn invoke(
        &self,
        _request: &AgentRequest,
        _cancel: &CancellationToken,
    ) -> Result<AgentInvocation, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }
}

/// Agent that always answers with one finding.
struct HealthyAgent;

#[async_trait]
impl Agent for HealthyAgent {
    fn name(&self) -> &str {
        "healthy"
    }

    fn supports(&self, _model: &str) -> bool {
        true
    }

    async fn invoke(
        &self,
        _request: &AgentRequest,
        _cancel: &CancellationToken,
    ) -> Result<AgentInvocation, AgentError> {
        Ok(AgentInvocation {
            raw_output: "```json\n{\"findings\": [{\"file\": \"a.rs\", \"line\": 1, \"message\": \"m\"}]}\n```".to_string(),
            stderr: String::new(),
            duration: Duration::from_millis(1),
        })
    }
}

async fn seed_rule(
    pool: &sqlx::SqlitePool,
    agents: &[&str],
) -> (verust_db::models::Review, verust_db::models::ReviewRule) {
    let review = insert_test_review(pool, "https://example.com/a/b").await;
    let config = serde_json::json!({
        "id": "style",
        "agents": agents,
    });
    let rule = rules::insert_rule(
        pool,
        &NewReviewRule {
            review_id: review.id,
            rule_index: 0,
            rule_id: "style".to_string(),
            rule_config: config,
            multi_run_enabled: false,
            multi_run_runs: 1,
        },
    )
    .await
    .unwrap();
    (review, rule)
}

#[tokio::test]
async fn transport_error_fails_over_to_next_agent() {
    let (pool, dir) = create_test_db().await;
    let (review, rule) = seed_rule(&pool, &["flaky", "healthy"]).await;

    let flaky = Arc::new(BrokenAgent {
        agent_name: "flaky",
        error: || AgentError::Transport("connection refused".to_string()),
        calls: AtomicUsize::new(0),
    });
    let mut registry = AgentRegistry::new();
    registry.register(flaky.clone() as Arc<dyn Agent>);
    registry.register(Arc::new(HealthyAgent) as Arc<dyn Agent>);

    let executor = RuleExecutor::new(pool.clone(), Arc::new(registry));
    let outcome = executor
        .execute(
            &ExecutionContext {
                review: &review,
                workspace: dir.path(),
                diff: "",
                changed_files: &[],
                output_language: "en",
            },
            &rule,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, RuleOutcome::Completed { findings: 1 });
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);

    // Two physical attempts were recorded: the transport-dead one and
    // the successful failover.
    let recorded = runs::get_runs_for_rule(&pool, rule.id).await.unwrap();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].agent, "flaky");
    assert_eq!(recorded[0].status, RunStatus::Failed);
    assert_eq!(recorded[1].agent, "healthy");
    assert_eq!(recorded[1].status, RunStatus::Completed);
    assert_eq!(recorded[1].findings_count, 1);
}

#[tokio::test]
async fn non_transport_error_does_not_fail_over() {
    let (pool, dir) = create_test_db().await;
    let (review, rule) = seed_rule(&pool, &["timing-out", "healthy"]).await;

    let slow = Arc::new(BrokenAgent {
        agent_name: "timing-out",
        error: || AgentError::Timeout(Duration::from_secs(300)),
        calls: AtomicUsize::new(0),
    });
    let mut registry = AgentRegistry::new();
    registry.register(slow.clone() as Arc<dyn Agent>);
    registry.register(Arc::new(HealthyAgent) as Arc<dyn Agent>);

    let executor = RuleExecutor::new(pool.clone(), Arc::new(registry));
    let outcome = executor
        .execute(
            &ExecutionContext {
                review: &review,
                workspace: dir.path(),
                diff: "",
                changed_files: &[],
                output_language: "en",
            },
            &rule,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // A timeout is that agent's answer; the rule fails without trying
    // the next agent.
    match outcome {
        RuleOutcome::Failed { error } => assert!(error.contains("timed out"), "{error}"),
        other => panic!("expected failure, got {other:?}"),
    }

    let recorded = runs::get_runs_for_rule(&pool, rule.id).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].status, RunStatus::Failed);
    assert!(recorded[0].error_message.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn exhausted_preference_list_fails_the_rule() {
    let (pool, dir) = create_test_db().await;
    let (review, rule) = seed_rule(&pool, &["flaky"]).await;

    let flaky = Arc::new(BrokenAgent {
        agent_name: "flaky",
        error: || AgentError::Transport("connection refused".to_string()),
        calls: AtomicUsize::new(0),
    });
    let mut registry = AgentRegistry::new();
    registry.register(flaky as Arc<dyn Agent>);

    let executor = RuleExecutor::new(pool.clone(), Arc::new(registry));
    let outcome = executor
        .execute(
            &ExecutionContext {
                review: &review,
                workspace: dir.path(),
                diff: "",
                changed_files: &[],
                output_language: "en",
            },
            &rule,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(matches!(outcome, RuleOutcome::Failed { .. }));
}

#[tokio::test]
async fn unknown_agent_names_are_skipped() {
    let (pool, dir) = create_test_db().await;
    let (review, rule) = seed_rule(&pool, &["no-such-agent", "healthy"]).await;

    let mut registry = AgentRegistry::new();
    registry.register(Arc::new(HealthyAgent) as Arc<dyn Agent>);

    let executor = RuleExecutor::new(pool.clone(), Arc::new(registry));
    let outcome = executor
        .execute(
            &ExecutionContext {
                review: &review,
                workspace: dir.path(),
                diff: "",
                changed_files: &[],
                output_language: "en",
            },
            &rule,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, RuleOutcome::Completed { findings: 1 });
}
