//! The `verust status` command: review list or single-review detail.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use verust_db::queries::{findings, reviews, rules, runs};

pub async fn run_status(pool: &SqlitePool, review_id: Option<&str>) -> Result<()> {
    match review_id {
        None => list_reviews(pool).await,
        Some(raw) => {
            let id = Uuid::parse_str(raw).with_context(|| format!("invalid review ID: {raw}"))?;
            show_review(pool, id).await
        }
    }
}

async fn list_reviews(pool: &SqlitePool) -> Result<()> {
    let counts = reviews::count_reviews_by_status(pool).await?;
    println!(
        "{} reviews: {} pending, {} running, {} completed, {} failed, {} cancelled",
        counts.total,
        counts.pending,
        counts.running,
        counts.completed,
        counts.failed,
        counts.cancelled
    );
    println!();

    let recent = reviews::list_recent_reviews(pool, 20).await?;
    if recent.is_empty() {
        println!("No reviews yet.");
        return Ok(());
    }

    println!("{:<38} {:<10} {:<8} {}", "ID", "STATUS", "RETRIES", "REPO");
    for review in recent {
        println!(
            "{:<38} {:<10} {:<8} {}",
            review.id, review.status, review.retry_count, review.repo_url
        );
    }
    Ok(())
}

async fn show_review(pool: &SqlitePool, id: Uuid) -> Result<()> {
    let review = reviews::get_review(pool, id)
        .await?
        .with_context(|| format!("review {id} not found"))?;

    println!("Review {}", review.id);
    println!("  repo:    {}", review.repo_url);
    if !review.git_ref.is_empty() {
        println!("  ref:     {}", review.git_ref);
    }
    if let Some(pr) = review.pr_number {
        println!("  PR:      #{pr}");
    }
    println!("  status:  {}", review.status);
    println!("  retries: {}", review.retry_count);
    if let Some(error) = &review.error_message {
        println!("  error:   {error}");
    }
    if let Some(duration) = review.duration_ms {
        println!("  took:    {duration}ms");
    }
    println!(
        "  diff:    +{} -{} across {} files, {} commits",
        review.lines_added, review.lines_deleted, review.files_changed, review.commit_count
    );

    for rule in rules::get_rules_for_review(pool, id).await? {
        println!();
        println!("  rule [{}] {} -- {}", rule.rule_index, rule.rule_id, rule.status);
        if let Some(error) = &rule.error_message {
            println!("    error: {error}");
        }
        for run in runs::get_runs_for_rule(pool, rule.id).await? {
            println!(
                "    run {} via {} -- {} ({} findings)",
                run.run_index, run.agent, run.status, run.findings_count
            );
            for finding in findings::get_findings_for_run(pool, run.id).await? {
                println!(
                    "      [{}] {}:{}-{} {}",
                    finding.severity,
                    finding.file,
                    finding.line_start,
                    finding.line_end,
                    finding.message
                );
            }
        }
    }
    Ok(())
}
