//! The `verust submit` command: manual review submission.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use verust_db::queries::reviews::NewReview;

use crate::serve_cmd::build_engine;

pub struct SubmitArgs {
    pub repo_url: String,
    pub git_ref: String,
    pub pr_number: Option<i64>,
    pub commit_sha: Option<String>,
}

pub async fn run_submit(pool: &SqlitePool, args: SubmitArgs) -> Result<()> {
    let (engine, _queue, _ready_rx) =
        build_engine(pool, None, CancellationToken::new()).await?;

    let review = engine
        .submit(NewReview {
            repo_url: args.repo_url,
            git_ref: args.git_ref,
            commit_sha: args.commit_sha.unwrap_or_default(),
            pr_number: args.pr_number,
            source: "manual".to_string(),
            ..Default::default()
        })
        .await
        .context("submit rejected")?;

    println!("Review {} submitted for {}", review.id, review.repo_url);
    println!("A running `verust serve` instance picks it up via recovery at startup;");
    println!("use the HTTP API to submit into a live server.");
    Ok(())
}
