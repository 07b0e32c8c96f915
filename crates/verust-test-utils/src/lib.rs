//! Shared test utilities for verust integration tests.
//!
//! Each test gets its own migrated SQLite database in a temp directory.
//! Keep the returned `TempDir` alive for the duration of the test; the
//! database file is removed with it.

use sqlx::SqlitePool;
use tempfile::TempDir;

use verust_db::config::DbConfig;
use verust_db::pool;
use verust_db::queries::reviews::{self, NewReview};

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, dir)`. Dropping `dir` deletes the database file, so
/// bind it in the test (`let (pool, _dir) = ...`).
pub async fn create_test_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let config = DbConfig::new(dir.path().join("verust-test.db"));

    let db_pool = pool::create_pool(&config)
        .await
        .expect("failed to open temp database");

    pool::run_migrations(&db_pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    (db_pool, dir)
}

/// Insert a pending review for `repo_url` with defaults suitable for tests.
pub async fn insert_test_review(pool: &SqlitePool, repo_url: &str) -> verust_db::models::Review {
    reviews::insert_review(
        pool,
        &NewReview {
            repo_url: repo_url.to_string(),
            git_ref: "main".to_string(),
            commit_sha: "0000000000000000000000000000000000000000".to_string(),
            source: "test".to_string(),
            ..Default::default()
        },
    )
    .await
    .expect("failed to insert test review")
}
