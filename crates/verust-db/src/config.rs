use std::env;
use std::path::PathBuf;

/// Database configuration.
///
/// Reads from the `VERUST_DATABASE_PATH` environment variable, falling back
/// to `./verust.db` when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
}

impl DbConfig {
    /// The default database file used when no environment variable is set.
    pub const DEFAULT_PATH: &str = "./verust.db";

    /// Build a config from the environment.
    ///
    /// Priority: `VERUST_DATABASE_PATH` env var, then the compile-time default.
    pub fn from_env() -> Self {
        let database_path = env::var("VERUST_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(Self::DEFAULT_PATH));
        Self { database_path }
    }

    /// Build a config from an explicit path (useful for tests and CLI flags).
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_PATH);
        assert_eq!(cfg.database_path, PathBuf::from("./verust.db"));
    }

    #[test]
    fn explicit_new() {
        let cfg = DbConfig::new("/var/lib/verust/reviews.db");
        assert_eq!(
            cfg.database_path,
            PathBuf::from("/var/lib/verust/reviews.db")
        );
    }
}
