//! Per-review workspace directories.
//!
//! Each review clones into `<workspace_root>/<review_id>`. The guard
//! removes the directory when dropped, so every exit path of the worker
//! body (success, failure, panic unwind) cleans up.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use uuid::Uuid;

/// Manages the workspace root directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, review_id: Uuid) -> PathBuf {
        self.root.join(review_id.to_string())
    }

    /// Reserve a clean workspace path for a review.
    ///
    /// The directory itself is *not* created (git clone wants to create
    /// the destination); any stale directory from a crashed earlier run
    /// is removed first.
    pub fn prepare(&self, review_id: Uuid) -> Result<WorkspaceGuard> {
        std::fs::create_dir_all(&self.root).with_context(|| {
            format!("failed to create workspace root {}", self.root.display())
        })?;

        let path = self.path_for(review_id);
        if path.exists() {
            debug!(path = %path.display(), "removing stale workspace");
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("failed to remove stale workspace {}", path.display()))?;
        }

        Ok(WorkspaceGuard { path })
    }

    /// Remove workspace directories that do not belong to `active` review
    /// ids. Used by the retention sweep for directories orphaned by
    /// crashes.
    pub fn sweep_orphans(&self, active: &std::collections::HashSet<Uuid>) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let keep = name
                .to_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .is_some_and(|id| active.contains(&id));
            if !keep {
                if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                    warn!(path = %entry.path().display(), error = %e, "failed to remove orphan workspace");
                } else {
                    removed += 1;
                }
            }
        }
        removed
    }
}

/// Owns one review's workspace directory for the duration of processing.
#[derive(Debug)]
pub struct WorkspaceGuard {
    path: PathBuf,
}

impl WorkspaceGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(path = %self.path.display(), error = %e, "workspace cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn prepare_removes_stale_dir_and_guard_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let id = Uuid::now_v7();

        // Simulate a stale workspace from a crashed run.
        let stale = manager.path_for(id);
        std::fs::create_dir_all(stale.join("leftover")).unwrap();

        let guard = manager.prepare(id).unwrap();
        assert!(!guard.path().exists(), "prepare must clear the path");

        std::fs::create_dir_all(guard.path().join("checkout")).unwrap();
        let path = guard.path().to_path_buf();
        drop(guard);
        assert!(!path.exists(), "drop must remove the workspace");
    }

    #[test]
    fn sweep_removes_unknown_dirs_and_keeps_active() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());

        let active_id = Uuid::now_v7();
        std::fs::create_dir_all(manager.path_for(active_id)).unwrap();
        std::fs::create_dir_all(manager.path_for(Uuid::now_v7())).unwrap();
        std::fs::create_dir_all(root.path().join("not-a-uuid")).unwrap();

        let mut active = HashSet::new();
        active.insert(active_id);

        let removed = manager.sweep_orphans(&active);
        assert_eq!(removed, 2);
        assert!(manager.path_for(active_id).exists());
    }
}
