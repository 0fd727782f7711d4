//! In-memory `Vcs` for tests. Worktree directories are real (so filesystem
//! checks behave), everything else lives in a mutex-guarded model.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{BranchNote, CommitInfo, Vcs, WorktreeInfo};
use crate::errors::VcsError;

#[derive(Default)]
struct MockState {
    branches: HashMap<String, Vec<CommitInfo>>,
    notes: HashMap<String, BranchNote>,
    /// path -> branch (`None` = detached)
    worktrees: HashMap<PathBuf, Option<String>>,
    dirty: HashSet<PathBuf>,
    unpushed: HashMap<PathBuf, usize>,
    transient_create_failures: usize,
    fail_create: Option<String>,
    fail_remove: Option<String>,
}

#[derive(Default)]
pub struct MockVcs {
    state: Mutex<MockState>,
    create_delay: Option<Duration>,
    pub create_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
}

impl MockVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn add_branch(&self, branch: &str) {
        self.state().branches.entry(branch.to_string()).or_default();
    }

    pub fn delete_branch(&self, branch: &str) {
        self.state().branches.remove(branch);
    }

    pub fn add_commit(&self, branch: &str, time: DateTime<Utc>, paths: &[&str]) {
        let mut state = self.state();
        let commits = state.branches.entry(branch.to_string()).or_default();
        let id = format!("{:040x}", commits.len() + 1);
        commits.insert(
            0,
            CommitInfo {
                id,
                time,
                summary: format!("commit on {}", branch),
                paths: paths.iter().map(|p| p.to_string()).collect(),
            },
        );
    }

    pub fn set_dirty(&self, path: &Path, dirty: bool) {
        let mut state = self.state();
        if dirty {
            state.dirty.insert(path.to_path_buf());
        } else {
            state.dirty.remove(path);
        }
    }

    pub fn set_unpushed(&self, path: &Path, count: usize) {
        self.state().unpushed.insert(path.to_path_buf(), count);
    }

    /// Point the worktree at `path` to another branch (or detach it).
    pub fn set_worktree_branch(&self, path: &Path, branch: Option<&str>) {
        self.state()
            .worktrees
            .insert(path.to_path_buf(), branch.map(str::to_string));
    }

    /// Forget a worktree registration without touching the directory.
    pub fn forget_worktree(&self, path: &Path) {
        self.state().worktrees.remove(path);
    }

    pub fn fail_next_creates(&self, transient: usize) {
        self.state().transient_create_failures = transient;
    }

    pub fn fail_creates_with(&self, stderr: &str) {
        self.state().fail_create = Some(stderr.to_string());
    }

    /// Make every `remove_worktree` fail with `stderr`; `None` clears it.
    pub fn fail_removes_with(&self, stderr: Option<&str>) {
        self.state().fail_remove = stderr.map(str::to_string);
    }

    pub fn has_worktree(&self, path: &Path) -> bool {
        self.state().worktrees.contains_key(path)
    }

    pub fn note(&self, branch: &str) -> Option<BranchNote> {
        self.state().notes.get(branch).cloned()
    }

    fn branch_in_use(state: &MockState, branch: &str) -> bool {
        state
            .worktrees
            .values()
            .any(|b| b.as_deref() == Some(branch))
    }
}

#[async_trait]
impl Vcs for MockVcs {
    async fn create_worktree(&self, path: &Path, branch: &str, _base: &str) -> Result<(), VcsError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if state.transient_create_failures > 0 {
            state.transient_create_failures -= 1;
            return Err(VcsError::CommandFailed {
                command: "worktree add".to_string(),
                stderr: "fatal: Unable to create '.git/index.lock': File exists".to_string(),
            });
        }
        if let Some(stderr) = state.fail_create.clone() {
            return Err(VcsError::CommandFailed {
                command: "worktree add".to_string(),
                stderr,
            });
        }
        if state.branches.contains_key(branch) {
            return Err(VcsError::CommandFailed {
                command: "worktree add".to_string(),
                stderr: format!("fatal: a branch named '{}' already exists", branch),
            });
        }
        std::fs::create_dir_all(path).map_err(VcsError::Io)?;
        state.branches.insert(branch.to_string(), Vec::new());
        state
            .worktrees
            .insert(path.to_path_buf(), Some(branch.to_string()));
        Ok(())
    }

    async fn attach_worktree(&self, path: &Path, branch: &str) -> Result<(), VcsError> {
        let mut state = self.state();
        if !state.branches.contains_key(branch) {
            return Err(VcsError::CommandFailed {
                command: "worktree add".to_string(),
                stderr: format!("fatal: invalid reference: {}", branch),
            });
        }
        if Self::branch_in_use(&state, branch) {
            return Err(VcsError::CommandFailed {
                command: "worktree add".to_string(),
                stderr: format!("fatal: '{}' is already checked out", branch),
            });
        }
        std::fs::create_dir_all(path).map_err(VcsError::Io)?;
        state
            .worktrees
            .insert(path.to_path_buf(), Some(branch.to_string()));
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), VcsError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(stderr) = state.fail_remove.clone() {
            return Err(VcsError::CommandFailed {
                command: "worktree remove".to_string(),
                stderr,
            });
        }
        if !force && state.dirty.contains(path) {
            return Err(VcsError::CommandFailed {
                command: "worktree remove".to_string(),
                stderr: "contains modified or untracked files, use --force to delete it".into(),
            });
        }
        state.worktrees.remove(path);
        state.dirty.remove(path);
        let _ = std::fs::remove_dir_all(path);
        Ok(())
    }

    async fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, VcsError> {
        Ok(self
            .state()
            .worktrees
            .iter()
            .map(|(path, branch)| WorktreeInfo {
                path: path.clone(),
                branch: branch.clone(),
                head: None,
                prunable: !path.exists(),
            })
            .collect())
    }

    async fn prune_worktrees(&self) -> Result<(), VcsError> {
        self.state().worktrees.retain(|path, _| path.exists());
        Ok(())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, VcsError> {
        Ok(self.state().branches.contains_key(branch))
    }

    async fn worktree_branch(&self, path: &Path) -> Result<Option<String>, VcsError> {
        self.state()
            .worktrees
            .get(path)
            .cloned()
            .ok_or_else(|| VcsError::CommandFailed {
                command: "rev-parse".to_string(),
                stderr: format!("{} is not a git worktree", path.display()),
            })
    }

    async fn checkout(&self, path: &Path, branch: &str) -> Result<(), VcsError> {
        let mut state = self.state();
        if !state.branches.contains_key(branch) || Self::branch_in_use(&state, branch) {
            return Err(VcsError::CommandFailed {
                command: "checkout".to_string(),
                stderr: format!("cannot check out {}", branch),
            });
        }
        state
            .worktrees
            .insert(path.to_path_buf(), Some(branch.to_string()));
        Ok(())
    }

    async fn is_dirty(&self, path: &Path) -> Result<bool, VcsError> {
        Ok(self.state().dirty.contains(path))
    }

    async fn unpushed_commits(&self, path: &Path) -> Result<usize, VcsError> {
        Ok(self.state().unpushed.get(path).copied().unwrap_or(0))
    }

    async fn write_note(&self, branch: &str, note: &BranchNote) -> Result<(), VcsError> {
        let mut state = self.state();
        if !state.branches.contains_key(branch) {
            return Err(VcsError::CommandFailed {
                command: "notes add".to_string(),
                stderr: format!("branch {} not found", branch),
            });
        }
        state.notes.insert(branch.to_string(), note.clone());
        Ok(())
    }

    async fn read_note(&self, branch: &str) -> Result<Option<BranchNote>, VcsError> {
        let state = self.state();
        if !state.branches.contains_key(branch) {
            return Ok(None);
        }
        Ok(state.notes.get(branch).cloned())
    }

    async fn commits_since(
        &self,
        branch: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CommitInfo>, VcsError> {
        Ok(self
            .state()
            .branches
            .get(branch)
            .map(|commits| commits.iter().filter(|c| c.time > since).cloned().collect())
            .unwrap_or_default())
    }

    async fn last_commit_time(&self, branch: &str) -> Result<Option<DateTime<Utc>>, VcsError> {
        Ok(self
            .state()
            .branches
            .get(branch)
            .and_then(|commits| commits.iter().map(|c| c.time).max()))
    }
}
