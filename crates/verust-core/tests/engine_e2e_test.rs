//! End-to-end pipeline tests with stub provider and agent: happy path,
//! same-repo serialization, cross-repo parallelism, empty plans, and
//! multi-run voting.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{RunBehavior, StubAgent, TestEnv};
use verust_db::models::{ReviewStatus, RuleStatus, RunStatus};
use verust_db::queries::reviews::NewReview;
use verust_db::queries::settings::set_setting;
use verust_db::queries::{findings, rules, runs};

const REPO: &str = "https://example.com/acme/widgets";
const WAIT: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_persists_rule_run_findings() {
    let mut env = TestEnv::new(StubAgent::with_default(RunBehavior::quick_success(2))).await;
    env.start(4);

    let review = env.submit(REPO).await;
    assert_eq!(review.status, ReviewStatus::Pending);

    let done = env.wait_for_status(review.id, ReviewStatus::Completed, WAIT).await;
    assert!(done.error_message.is_none());
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    assert!(done.duration_ms.is_some());

    let plan = rules::get_rules_for_review(&env.pool, review.id).await.unwrap();
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].rule_id, "style");
    assert_eq!(plan[0].status, RuleStatus::Completed);

    let rule_runs = runs::get_runs_for_rule(&env.pool, plan[0].id).await.unwrap();
    assert_eq!(rule_runs.len(), 1);
    assert_eq!(rule_runs[0].status, RunStatus::Completed);
    assert_eq!(rule_runs[0].findings_count, 2);
    assert_eq!(rule_runs[0].agent, "stub");
    assert!(!rule_runs[0].prompt.is_empty());

    let persisted = findings::get_findings_for_review(&env.pool, review.id)
        .await
        .unwrap();
    assert_eq!(persisted.len(), 2);
    assert_eq!(persisted[0].severity, "minor");

    env.wait_for_idle(WAIT).await;
    env.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_repo_reviews_run_serially_in_order() {
    let mut env = TestEnv::new(StubAgent::with_default(RunBehavior::Succeed {
        findings: 0,
        delay: Duration::from_millis(40),
    }))
    .await;
    env.start(4);

    let r1 = env.submit(REPO).await;
    let r2 = env.submit(REPO).await;
    let r3 = env.submit(REPO).await;

    for id in [r1.id, r2.id, r3.id] {
        env.wait_for_status(id, ReviewStatus::Completed, WAIT).await;
    }

    let clone_order = env.provider.clones.lock().unwrap().clone();
    assert_eq!(clone_order, vec![r1.id, r2.id, r3.id], "FIFO per repo");
    assert_eq!(
        env.agent.peak_active.load(Ordering::SeqCst),
        1,
        "same-repo reviews must never overlap"
    );

    env.wait_for_idle(WAIT).await;
    env.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn distinct_repos_overlap_up_to_worker_count() {
    let mut env = TestEnv::new(StubAgent::with_default(RunBehavior::Succeed {
        findings: 0,
        delay: Duration::from_millis(150),
    }))
    .await;
    env.start(4);

    let mut ids = Vec::new();
    for repo in ["a/a", "b/b", "c/c", "d/d"] {
        ids.push(env.submit(&format!("https://example.com/{repo}")).await.id);
    }
    for id in ids {
        env.wait_for_status(id, ReviewStatus::Completed, WAIT).await;
    }

    assert!(
        env.agent.peak_active.load(Ordering::SeqCst) >= 2,
        "cross-repo reviews should overlap"
    );

    env.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_rule_plan_completes_without_invoking_agents() {
    let mut env = TestEnv::new(StubAgent::with_default(RunBehavior::quick_success(0))).await;
    set_setting(&env.pool, "rules", "default", &serde_json::json!({ "rules": [] }))
        .await
        .unwrap();
    env.start(2);

    let review = env.submit(REPO).await;
    let done = env.wait_for_status(review.id, ReviewStatus::Completed, WAIT).await;

    assert!(done.error_message.is_none());
    let plan = rules::get_rules_for_review(&env.pool, review.id).await.unwrap();
    assert!(plan.is_empty());
    assert_eq!(env.agent.invocations.load(Ordering::SeqCst), 0);

    env.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pull_request_review_uses_pr_clone_and_enriches_metadata() {
    let mut env = TestEnv::new(StubAgent::with_default(RunBehavior::quick_success(1))).await;
    env.start(2);

    let review = env
        .engine
        .submit(NewReview {
            repo_url: REPO.to_string(),
            git_ref: String::new(),
            pr_number: Some(42),
            source: "webhook".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let done = env.wait_for_status(review.id, ReviewStatus::Completed, WAIT).await;
    assert_eq!(done.pr_title.as_deref(), Some("Stub PR"));
    assert_eq!(done.author.as_deref(), Some("stub-author"));

    env.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_run_vote_keeps_agreeing_findings() {
    let mut env = TestEnv::new(StubAgent::with_default(RunBehavior::quick_success(1))).await;
    set_setting(
        &env.pool,
        "rules",
        "default",
        &serde_json::json!({
            "rules": [ {
                "id": "consensus",
                "multi_run": { "enabled": true, "runs": 3 }
            } ]
        }),
    )
    .await
    .unwrap();
    env.start(2);

    let review = env.submit(REPO).await;
    env.wait_for_status(review.id, ReviewStatus::Completed, WAIT).await;

    assert_eq!(env.agent.invocations.load(Ordering::SeqCst), 3);
    let plan = rules::get_rules_for_review(&env.pool, review.id).await.unwrap();
    assert_eq!(plan[0].status, RuleStatus::Completed);
    let rule_runs = runs::get_runs_for_rule(&env.pool, plan[0].id).await.unwrap();
    assert_eq!(rule_runs.len(), 3);
    assert!(rule_runs.iter().all(|r| r.status == RunStatus::Completed));

    env.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_run_below_quorum_fails_the_rule() {
    let agent = StubAgent::with_default(RunBehavior::quick_success(1));
    // Two of three runs fail: quorum (2) cannot be met.
    agent.push_behavior(RunBehavior::Fail {
        message: "model unavailable".to_string(),
    });
    agent.push_behavior(RunBehavior::Fail {
        message: "model unavailable".to_string(),
    });

    let mut env = TestEnv::new(agent).await;
    set_setting(
        &env.pool,
        "rules",
        "default",
        &serde_json::json!({
            "rules": [ {
                "id": "consensus",
                "multi_run": { "enabled": true, "runs": 3 }
            } ]
        }),
    )
    .await
    .unwrap();
    env.start(2);

    let review = env.submit(REPO).await;
    let done = env.wait_for_status(review.id, ReviewStatus::Failed, WAIT).await;

    assert!(done.error_message.is_some());
    let plan = rules::get_rules_for_review(&env.pool, review.id).await.unwrap();
    assert_eq!(plan[0].status, RuleStatus::Failed);

    env.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repo_rule_file_refreezes_untouched_plan() {
    let mut env = TestEnv::new(StubAgent::with_default(RunBehavior::quick_success(1))).await;
    env.provider
        .set_rules_file("rules:\n  - id: from-repo\n  - id: also-from-repo\n    enabled: false\n");
    env.start(2);

    let review = env.submit(REPO).await;
    env.wait_for_status(review.id, ReviewStatus::Completed, WAIT).await;

    let plan = rules::get_rules_for_review(&env.pool, review.id).await.unwrap();
    assert_eq!(plan.len(), 1, "repo file replaces the store default plan");
    assert_eq!(plan[0].rule_id, "from-repo");
    assert_eq!(plan[0].status, RuleStatus::Completed);

    env.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_repo_rule_file_fails_before_rules_run() {
    let mut env = TestEnv::new(StubAgent::with_default(RunBehavior::quick_success(1))).await;
    env.provider.set_rules_file("rules: [ {");
    env.start(2);

    let review = env.submit(REPO).await;
    let done = env.wait_for_status(review.id, ReviewStatus::Failed, WAIT).await;

    assert!(done.error_message.unwrap().contains("rule file"));
    assert_eq!(
        env.agent.invocations.load(Ordering::SeqCst),
        0,
        "configuration errors fail the review before any rule runs"
    );

    env.shutdown().await;
}

#[tokio::test]
async fn submit_rejects_invalid_requests() {
    use verust_core::engine::SubmitError;

    let env = TestEnv::new(StubAgent::with_default(RunBehavior::quick_success(0))).await;

    let err = env
        .engine
        .submit(NewReview {
            repo_url: String::new(),
            git_ref: "main".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::MissingRepoUrl));

    let err = env
        .engine
        .submit(NewReview {
            repo_url: "git@github.com:a/b.git".to_string(),
            git_ref: "main".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::InvalidRepoUrl(_)));

    let err = env
        .engine
        .submit(NewReview {
            repo_url: REPO.to_string(),
            git_ref: String::new(),
            pr_number: None,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::MissingRevision));

    env.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_rule_does_not_abort_later_rules() {
    let agent = StubAgent::with_default(RunBehavior::quick_success(1));
    agent.push_behavior(RunBehavior::Fail {
        message: "first rule breaks".to_string(),
    });

    let mut env = TestEnv::new(agent).await;
    set_setting(
        &env.pool,
        "rules",
        "default",
        &serde_json::json!({ "rules": [ { "id": "first" }, { "id": "second" } ] }),
    )
    .await
    .unwrap();
    env.start(2);

    let review = env.submit(REPO).await;
    let done = env.wait_for_status(review.id, ReviewStatus::Failed, WAIT).await;

    let plan = rules::get_rules_for_review(&env.pool, review.id).await.unwrap();
    assert_eq!(plan[0].status, RuleStatus::Failed);
    assert_eq!(plan[1].status, RuleStatus::Completed, "second rule still ran");
    assert!(done.error_message.unwrap().contains("first"));

    env.shutdown().await;
}
