//! The `verust serve` command: HTTP API + webhook entry point, wired to
//! the full review pipeline (queue, dispatcher, recovery, retention).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use verust_core::agent::AgentRegistry;
use verust_core::cleanup::RetentionService;
use verust_core::config::{ReviewSettings, load_agent_settings, load_provider_settings};
use verust_core::dispatch::{Dispatcher, DispatcherConfig, TaskProcessor};
use verust_core::engine::{Engine, SubmitError};
use verust_core::notify::NotificationManager;
use verust_core::provider::github::GithubProvider;
use verust_core::provider::gitlab::GitlabProvider;
use verust_core::provider::{Provider, ProviderRegistry};
use verust_core::queue::RepoTaskQueue;
use verust_core::recovery::run_recovery;
use verust_core::retry::{RetryError, RetryHandler};
use verust_db::models::{Finding, Review, ReviewRule, ReviewRuleRun};
use verust_db::queries::{findings, reviews, rules, runs};
use verust_db::tasklog::TaskLogStore;

use crate::config::VerustConfig;
use crate::webhook::{self, WebhookError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<RetryError> for AppError {
    fn from(err: RetryError) -> Self {
        match &err {
            RetryError::NotFound(_) | RetryError::RuleNotFound { .. } => {
                Self::not_found(err.to_string())
            }
            RetryError::AlreadyQueued(_)
            | RetryError::InvalidStatus { .. }
            | RetryError::RetriesExhausted { .. } => Self::conflict(err.to_string()),
            RetryError::Internal(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: err.to_string(),
            },
        }
    }
}

impl From<SubmitError> for AppError {
    fn from(err: SubmitError) -> Self {
        match &err {
            SubmitError::Internal(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: err.to_string(),
            },
            _ => Self::bad_request(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// State and response types
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub engine: Arc<Engine>,
    pub queue: Arc<RepoTaskQueue>,
    pub retry: Arc<RetryHandler>,
    pub tasklog: Option<TaskLogStore>,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunDetailResponse {
    #[serde(flatten)]
    pub run: ReviewRuleRun,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Serialize)]
pub struct RuleDetailResponse {
    #[serde(flatten)]
    pub rule: ReviewRule,
    pub runs: Vec<RunDetailResponse>,
}

#[derive(Debug, Serialize)]
pub struct ReviewDetailResponse {
    #[serde(flatten)]
    pub review: Review,
    pub rules: Vec<RuleDetailResponse>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/webhooks/{provider}", post(handle_webhook))
        .route("/api/v1/reviews", get(list_reviews))
        .route("/api/v1/reviews/{id}", get(get_review_detail))
        .route("/api/v1/reviews/{id}/retry", post(retry_review))
        .route("/api/v1/reviews/{id}/rules/{rule_id}/retry", post(retry_rule))
        .route("/api/v1/reviews/{id}/cancel", post(cancel_review))
        .route("/api/v1/queue/stats", get(queue_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Runtime wiring
// ---------------------------------------------------------------------------

/// Build the provider registry from stored settings. GitHub and GitLab
/// adapters are always registered (tokenless when unconfigured); each
/// configured host is mapped to its adapter kind by host name.
pub async fn build_provider_registry(pool: &SqlitePool) -> Result<ProviderRegistry> {
    let settings = load_provider_settings(pool).await?;

    let mut github_token = None;
    let mut github_insecure = false;
    let mut gitlab_token = None;
    let mut gitlab_insecure = false;
    let mut host_kinds = Vec::new();

    for (host, provider) in &settings {
        if host.contains("gitlab") {
            gitlab_token = provider.token.clone().or(gitlab_token);
            gitlab_insecure |= provider.insecure_skip_verify;
            host_kinds.push((host.clone(), "gitlab"));
        } else {
            github_token = provider.token.clone().or(github_token);
            github_insecure |= provider.insecure_skip_verify;
            host_kinds.push((host.clone(), "github"));
        }
    }

    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(GithubProvider::new(github_token, github_insecure)?) as Arc<dyn Provider>);
    registry.register(Arc::new(GitlabProvider::new(gitlab_token, gitlab_insecure)?) as Arc<dyn Provider>);
    for (host, kind) in host_kinds {
        registry.register_host(host, kind);
    }
    Ok(registry)
}

/// Assemble the engine and its queue (dispatcher not yet started).
pub async fn build_engine(
    pool: &SqlitePool,
    tasklog: Option<TaskLogStore>,
    cancel: CancellationToken,
) -> Result<(Arc<Engine>, Arc<RepoTaskQueue>, mpsc::Receiver<()>)> {
    let providers = build_provider_registry(pool).await?;
    let agents = AgentRegistry::from_settings(&load_agent_settings(pool).await?);

    let (queue, ready_rx) = RepoTaskQueue::new();
    let queue = Arc::new(queue);

    let engine = Arc::new(Engine::new(
        pool.clone(),
        Arc::clone(&queue),
        Arc::new(providers),
        Arc::new(agents),
        Arc::new(NotificationManager::new(pool.clone())),
        tasklog,
        cancel,
    ));
    Ok((engine, queue, ready_rx))
}

/// Run the server until ctrl-c.
pub async fn run_serve(config: &VerustConfig) -> Result<()> {
    let pool = verust_db::pool::create_pool(&config.db_config).await?;
    verust_db::pool::run_migrations(&pool, verust_db::pool::default_migrations_path()).await?;

    let tasklog = TaskLogStore::open(&config.task_log_path).await?;
    let cancel = CancellationToken::new();

    let (engine, queue, ready_rx) =
        build_engine(&pool, Some(tasklog.clone()), cancel.clone()).await?;

    let settings = ReviewSettings::load(&pool).await?;
    let dispatcher = Dispatcher::start(
        Arc::clone(&queue),
        ready_rx,
        Arc::clone(&engine) as Arc<dyn TaskProcessor>,
        DispatcherConfig {
            workers: settings.max_concurrent,
            ..Default::default()
        },
        cancel.clone(),
    );

    // Recovery after the dispatcher is ready to receive readiness signals.
    run_recovery(&pool, &queue).await?;

    let retention = RetentionService::new(pool.clone(), tasklog.clone()).spawn(cancel.clone());

    let state = AppState {
        pool: pool.clone(),
        engine,
        queue: Arc::clone(&queue),
        retry: Arc::new(RetryHandler::new(pool.clone(), Arc::clone(&queue))),
        tasklog: Some(tasklog.clone()),
        webhook_secret: config.webhook_secret.clone(),
    };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.bind, config.port))?;
    tracing::info!("verust serve listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_cancel.cancel();
        })
        .await?;

    dispatcher.shutdown().await;
    let _ = retention.await;
    tasklog.close().await;
    pool.close().await;
    tracing::info!("verust serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<axum::response::Response, AppError> {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let mapped = match provider.as_str() {
        "github" => {
            if let Some(secret) = &state.webhook_secret {
                webhook::verify_github_signature(
                    secret,
                    &body,
                    header_str("x-hub-signature-256"),
                )
                .map_err(signature_rejection)?;
            }
            let event = header_str("x-github-event").unwrap_or("push");
            webhook::map_github_event(event, &body)
        }
        "gitlab" => {
            if let Some(secret) = &state.webhook_secret {
                webhook::verify_gitlab_token(secret, header_str("x-gitlab-token"))
                    .map_err(signature_rejection)?;
            }
            let event = header_str("x-gitlab-event").unwrap_or("push");
            webhook::map_gitlab_event(event, &body)
        }
        other => return Err(AppError::not_found(format!("unknown provider {other}"))),
    };

    let review = match mapped {
        Ok(Some(new_review)) => state.engine.submit(new_review).await?,
        Ok(None) => {
            return Ok((StatusCode::OK, Json(serde_json::json!({"status": "ignored"})))
                .into_response());
        }
        Err(e) => return Err(AppError::bad_request(e.to_string())),
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "accepted",
            "review_id": review.id,
        })),
    )
        .into_response())
}

fn signature_rejection(err: WebhookError) -> AppError {
    match err {
        WebhookError::MissingSignature | WebhookError::SignatureMismatch => {
            AppError::unauthorized(err.to_string())
        }
        other => AppError::bad_request(other.to_string()),
    }
}

async fn list_reviews(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let reviews = reviews::list_recent_reviews(&state.pool, 100)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(reviews).into_response())
}

async fn get_review_detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let review = reviews::get_review(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("review {id} not found")))?;

    let mut rule_details = Vec::new();
    for rule in rules::get_rules_for_review(&state.pool, id)
        .await
        .map_err(AppError::internal)?
    {
        let mut run_details = Vec::new();
        for run in runs::get_runs_for_rule(&state.pool, rule.id)
            .await
            .map_err(AppError::internal)?
        {
            let run_findings = findings::get_findings_for_run(&state.pool, run.id)
                .await
                .map_err(AppError::internal)?;
            run_details.push(RunDetailResponse {
                run,
                findings: run_findings,
            });
        }
        rule_details.push(RuleDetailResponse {
            rule,
            runs: run_details,
        });
    }

    Ok(Json(ReviewDetailResponse {
        review,
        rules: rule_details,
    })
    .into_response())
}

async fn retry_review(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let review = state.retry.retry(id).await?;
    Ok(Json(review).into_response())
}

async fn retry_rule(
    State(state): State<AppState>,
    Path((id, rule_id)): Path<(Uuid, String)>,
) -> Result<axum::response::Response, AppError> {
    let review = state.retry.retry_rule(id, &rule_id).await?;
    Ok(Json(review).into_response())
}

async fn cancel_review(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let cancelled = state
        .engine
        .cancel_review(id)
        .await
        .map_err(AppError::internal)?;
    if !cancelled {
        return Err(AppError::conflict(format!(
            "review {id} is not pending or running"
        )));
    }
    Ok(Json(serde_json::json!({"status": "cancelled"})).into_response())
}

async fn queue_stats(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    Ok(Json(state.queue.stats()).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
