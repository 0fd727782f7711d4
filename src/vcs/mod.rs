//! Version-control collaborator.
//!
//! Real implementation: [`GitVcs`]. Test double: `MockVcs`.

pub mod git;
#[cfg(test)]
pub mod mock;

pub use git::GitVcs;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::errors::VcsError;
use crate::orchestrator::state::{LifecycleState, Metrics};
use crate::role::Role;

/// Notes ref holding branch metadata.
pub const NOTES_REF: &str = "refs/notes/weave";

/// One entry of `git worktree list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    /// `None` when detached or bare.
    pub branch: Option<String>,
    pub head: Option<String>,
    pub prunable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: String,
    pub time: DateTime<Utc>,
    pub summary: String,
    pub paths: Vec<String>,
}

/// Metadata attached to a branch under [`NOTES_REF`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchNote {
    pub task_id: String,
    pub role: Role,
    pub status: LifecycleState,
    pub created_at: DateTime<Utc>,
}

/// Commit count and distinct files touched by `commits`.
pub fn summarize_commits(commits: &[CommitInfo]) -> Metrics {
    let files: BTreeSet<&str> = commits
        .iter()
        .flat_map(|c| c.paths.iter().map(String::as_str))
        .collect();
    Metrics {
        commit_count: commits.len() as u32,
        files_changed: files.len() as u32,
    }
}

/// Compare two paths, resolving symlinks when both exist.
pub fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[async_trait]
pub trait Vcs: Send + Sync {
    /// Create `branch` from `base` and check it out in a new worktree at `path`.
    async fn create_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<(), VcsError>;

    /// Check out an existing `branch` in a new worktree at `path`.
    async fn attach_worktree(&self, path: &Path, branch: &str) -> Result<(), VcsError>;

    async fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), VcsError>;

    async fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, VcsError>;

    /// Drop administrative entries for worktrees whose directory is gone.
    async fn prune_worktrees(&self) -> Result<(), VcsError>;

    async fn branch_exists(&self, branch: &str) -> Result<bool, VcsError>;

    /// Branch checked out in the worktree at `path`; `None` when detached.
    async fn worktree_branch(&self, path: &Path) -> Result<Option<String>, VcsError>;

    async fn checkout(&self, path: &Path, branch: &str) -> Result<(), VcsError>;

    /// Uncommitted changes (including untracked files) in the worktree.
    async fn is_dirty(&self, path: &Path) -> Result<bool, VcsError>;

    /// Commits ahead of the upstream; 0 when there is no upstream.
    async fn unpushed_commits(&self, path: &Path) -> Result<usize, VcsError>;

    async fn write_note(&self, branch: &str, note: &BranchNote) -> Result<(), VcsError>;

    async fn read_note(&self, branch: &str) -> Result<Option<BranchNote>, VcsError>;

    /// Commits reachable from `branch` newer than `since`, newest first.
    async fn commits_since(
        &self,
        branch: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CommitInfo>, VcsError>;

    async fn last_commit_time(&self, branch: &str) -> Result<Option<DateTime<Utc>>, VcsError>;
}
