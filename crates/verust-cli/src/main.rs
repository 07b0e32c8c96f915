mod config;
mod serve_cmd;
mod status_cmd;
mod submit_cmd;
mod webhook;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use verust_core::retry::RetryHandler;
use verust_db::pool;
use verust_db::tasklog::TaskLogStore;

use config::VerustConfig;

/// Exit code for startup/configuration failures (fatal runtime errors
/// exit 1, clean shutdown 0).
const EXIT_CONFIG: i32 = 2;

#[derive(Parser)]
#[command(name = "verust", about = "Webhook-driven AI code review orchestrator")]
struct Cli {
    /// Database file path (overrides config file and VERUST_DATABASE_PATH)
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the bootstrap config file (with a fresh webhook secret)
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create and migrate the database
    DbInit,
    /// Run the server: HTTP API, webhooks, and the review pipeline
    Serve {
        /// Listen address override
        #[arg(long)]
        bind: Option<String>,
        /// Listen port override
        #[arg(long)]
        port: Option<u16>,
    },
    /// Submit a review manually
    Submit {
        /// Repository URL (https)
        repo_url: String,
        /// Branch or tag to review
        #[arg(long, default_value = "main")]
        git_ref: String,
        /// Pull/merge request number (reviews the PR head instead of a ref)
        #[arg(long)]
        pr: Option<i64>,
        /// Expected head commit SHA
        #[arg(long)]
        commit_sha: Option<String>,
    },
    /// Show review status (omit the ID to list recent reviews)
    Status {
        /// Review ID
        review_id: Option<String>,
    },
    /// Retry a failed review, or a single rule of it
    Retry {
        /// Review ID
        review_id: String,
        /// Retry only this rule (by rule name)
        #[arg(long)]
        rule: Option<String>,
    },
    /// Cancel a pending or running review
    Cancel {
        /// Review ID
        review_id: String,
    },
    /// Show the structured task log of a review
    Logs {
        /// Review ID
        review_id: String,
    },
}

/// Errors split by exit code.
enum CliError {
    Config(anyhow::Error),
    Fatal(anyhow::Error),
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        Self::Fatal(err)
    }
}

fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let secret = config::generate_webhook_secret();
    let mut file = config::ConfigFile::default();
    file.server.webhook_secret = Some(secret.clone());

    let written = config::save_config(&file)?;
    println!("Config written to {}", written.display());
    println!("  database.path = {}", file.database.path.display());
    println!("  server.bind = {}:{}", file.server.bind, file.server.port);
    println!("  server.webhook_secret = {}...{}", &secret[..8], &secret[56..]);
    println!();
    println!("Next: run `verust db-init`, then `verust serve`.");
    Ok(())
}

async fn cmd_db_init(config: &VerustConfig) -> anyhow::Result<()> {
    println!("Initializing verust database...");

    let db_pool = pool::create_pool(&config.db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }
    db_pool.close().await;

    println!("verust db-init complete.");
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CliError> {
    // `init` must work before any config/database exists.
    if let Commands::Init { force } = &cli.command {
        return cmd_init(*force).map_err(CliError::Config);
    }

    let mut resolved =
        VerustConfig::resolve(cli.database.as_deref()).map_err(CliError::Config)?;

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::DbInit => {
            cmd_db_init(&resolved).await?;
        }
        Commands::Serve { bind, port } => {
            if let Some(bind) = bind {
                resolved.bind = bind;
            }
            if let Some(port) = port {
                resolved.port = port;
            }
            serve_cmd::run_serve(&resolved).await?;
        }
        Commands::Submit {
            repo_url,
            git_ref,
            pr,
            commit_sha,
        } => {
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = submit_cmd::run_submit(
                &db_pool,
                submit_cmd::SubmitArgs {
                    repo_url,
                    git_ref,
                    pr_number: pr,
                    commit_sha,
                },
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { review_id } => {
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, review_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Retry { review_id, rule } => {
            let id = uuid::Uuid::parse_str(&review_id)
                .with_context(|| format!("invalid review ID: {review_id}"))?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;

            // An offline retry resets store state; the review is picked
            // up by recovery when `verust serve` starts.
            let (queue, _ready_rx) = verust_core::queue::RepoTaskQueue::new();
            let handler = RetryHandler::new(db_pool.clone(), Arc::new(queue));
            let result = match rule {
                Some(rule_id) => handler.retry_rule(id, &rule_id).await,
                None => handler.retry(id).await,
            };
            db_pool.close().await;

            match result {
                Ok(review) => {
                    println!("Review {} reset to pending (retry #{}).", review.id, review.retry_count);
                }
                Err(e) => return Err(CliError::Fatal(anyhow::anyhow!(e))),
            }
        }
        Commands::Cancel { review_id } => {
            let id = uuid::Uuid::parse_str(&review_id)
                .with_context(|| format!("invalid review ID: {review_id}"))?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let (engine, _queue, _ready_rx) =
                serve_cmd::build_engine(&db_pool, None, CancellationToken::new()).await?;
            let cancelled = engine.cancel_review(id).await?;
            db_pool.close().await;

            if cancelled {
                println!("Review {review_id} cancelled.");
            } else {
                println!("Review {review_id} was not pending or running.");
            }
        }
        Commands::Logs { review_id } => {
            let id = uuid::Uuid::parse_str(&review_id)
                .with_context(|| format!("invalid review ID: {review_id}"))?;
            let store = TaskLogStore::open(&resolved.task_log_path).await?;
            let entries = store.entries_for_review(id).await?;
            if entries.is_empty() {
                println!("No task logs for review {review_id}.");
            }
            for entry in entries {
                println!(
                    "{} [{}] {} {}",
                    entry.recorded_at, entry.level, entry.message, entry.fields.0
                );
            }
            store.close().await;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => {}
        Err(CliError::Config(e)) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
        Err(CliError::Fatal(e)) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    }
}
