//! Isolation manager: one git worktree per task, one task per branch.

use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::state::{ExecutionContext, LifecycleState, Registry};
use crate::errors::OrchestrationError;
use crate::role::Role;
use crate::util::{sanitize_branch, slugify};
use crate::vcs::{BranchNote, Vcs, WorktreeInfo, same_path};

/// Role assumed when a workspace is re-registered without a metadata note.
pub const DEFAULT_ROLE: Role = Role::Engineer;

/// Result of a successful `recover`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Healthy,
    Repaired(String),
}

impl std::fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryOutcome::Healthy => f.write_str("healthy"),
            RecoveryOutcome::Repaired(action) => write!(f, "repaired: {}", action),
        }
    }
}

/// What `recover` decided to do, before doing it.
#[derive(Debug, Clone, PartialEq)]
enum Diagnosis {
    Healthy,
    Bind { path: PathBuf, branch: String },
    Recreate { path: PathBuf, branch: String },
    Checkout { path: PathBuf, branch: String },
    Adopt {
        path: PathBuf,
        branch: String,
        role: Role,
    },
    Manual(String),
    NotFound,
}

impl Diagnosis {
    fn describe(&self) -> String {
        match self {
            Diagnosis::Healthy => "healthy".to_string(),
            Diagnosis::Bind { path, branch } => {
                format!("bound {} on {} into the registry", path.display(), branch)
            }
            Diagnosis::Recreate { path, branch } => {
                format!("re-created worktree {} on {}", path.display(), branch)
            }
            Diagnosis::Checkout { path, branch } => {
                format!("checked out {} in {}", branch, path.display())
            }
            Diagnosis::Adopt { path, branch, role } => format!(
                "re-registered {} on {} as {}",
                path.display(),
                branch,
                role
            ),
            Diagnosis::Manual(reason) => reason.clone(),
            Diagnosis::NotFound => "not found".to_string(),
        }
    }
}

pub struct IsolationManager {
    vcs: Arc<dyn Vcs>,
    registry: Arc<Registry>,
    worktree_base: PathBuf,
    in_flight: Mutex<HashSet<String>>,
}

/// Exclusive claim on a branch for the duration of one allocation.
struct BranchClaim<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    branch: String,
}

impl Drop for BranchClaim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.branch);
    }
}

impl IsolationManager {
    pub fn new(vcs: Arc<dyn Vcs>, registry: Arc<Registry>, worktree_base: PathBuf) -> Self {
        Self {
            vcs,
            registry,
            worktree_base,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Where the workspace of `task_id` lives.
    pub fn workspace_path(&self, task_id: &str) -> PathBuf {
        self.worktree_base.join(slugify(task_id))
    }

    fn claim(&self, branch: &str) -> Result<BranchClaim<'_>, OrchestrationError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(branch.to_string()) {
            return Err(OrchestrationError::BranchInUse {
                branch: branch.to_string(),
                holder: None,
            });
        }
        Ok(BranchClaim {
            in_flight: &self.in_flight,
            branch: branch.to_string(),
        })
    }

    /// Checks that need no VCS side effect: the branch is free in the
    /// registry and in git, and the workspace directory does not exist yet.
    /// Returns the sanitised branch name.
    pub async fn preflight(&self, task_id: &str, branch: &str) -> Result<String, OrchestrationError> {
        let branch = sanitize_branch(branch);
        if branch.is_empty() {
            return Err(OrchestrationError::InvalidInput(
                "branch name is empty after sanitising".to_string(),
            ));
        }
        if let Some(holder) = self.registry.snapshot().branch_holder(&branch) {
            return Err(OrchestrationError::BranchInUse {
                branch,
                holder: Some(holder.task_id.clone()),
            });
        }

        let worktrees = self.vcs.list_worktrees().await?;
        if worktrees.iter().any(|w| w.branch.as_deref() == Some(branch.as_str())) {
            return Err(OrchestrationError::BranchInUse {
                branch,
                holder: None,
            });
        }

        let path = self.workspace_path(task_id);
        if path.exists() {
            return Err(OrchestrationError::InvalidInput(format!(
                "{} already exists; run `weave recover {}`",
                path.display(),
                task_id
            )));
        }
        Ok(branch)
    }

    /// Create the workspace for `task_id` on `branch`, derived from `base`.
    ///
    /// The first allocation of a branch wins; a racing or later one gets
    /// `BranchInUse`. If the registry refuses to bind (e.g. the audit log is
    /// unwritable) the new worktree is removed again. Cancellation after the
    /// worktree exists leaves it unbound; `recover` binds it.
    pub async fn allocate(
        &self,
        task_id: &str,
        branch: &str,
        base: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, OrchestrationError> {
        if cancel.is_cancelled() {
            return Err(OrchestrationError::Cancelled);
        }
        let _claim = self.claim(&sanitize_branch(branch))?;

        let ctx = {
            let snapshot = self.registry.snapshot();
            match snapshot.active(task_id) {
                Some(ctx) => ctx.clone(),
                None => {
                    return Err(match snapshot.latest(task_id) {
                        Some(archived) => OrchestrationError::TerminalState {
                            task_id: task_id.to_string(),
                            state: archived.state,
                        },
                        None => OrchestrationError::NotFound {
                            task_id: task_id.to_string(),
                        },
                    });
                }
            }
        };
        if ctx.has_workspace() {
            return Err(OrchestrationError::InvalidInput(format!(
                "task {} already has a workspace on {}",
                task_id,
                ctx.branch.as_deref().unwrap_or("?")
            )));
        }

        let branch = self.preflight(task_id, branch).await?;
        let path = self.workspace_path(task_id);

        let reuse = self.vcs.branch_exists(&branch).await?;
        let create = async {
            if reuse {
                self.vcs.attach_worktree(&path, &branch).await
            } else {
                self.vcs.create_worktree(&path, &branch, base).await
            }
        };
        tokio::select! {
            result = create => result.map_err(|source| OrchestrationError::AllocationFailed {
                branch: branch.clone(),
                source,
            })?,
            _ = cancel.cancelled() => return Err(OrchestrationError::Cancelled),
        }

        if cancel.is_cancelled() {
            return Err(OrchestrationError::Cancelled);
        }

        if let Err(err) = self.registry.bind_workspace(task_id, &path, &branch) {
            warn!(task_id, branch = %branch, error = %err, "binding failed; removing new worktree");
            if let Err(cleanup) = self.vcs.remove_worktree(&path, true).await {
                warn!(task_id, error = %cleanup, "could not remove worktree after failed bind");
            }
            return Err(err);
        }

        let note = BranchNote {
            task_id: task_id.to_string(),
            role: ctx.role,
            status: ctx.state,
            created_at: Utc::now(),
        };
        if let Err(e) = self.vcs.write_note(&branch, &note).await {
            warn!(task_id, branch = %branch, error = %e, "could not attach branch metadata note");
        }

        info!(task_id, branch = %branch, path = %path.display(), "workspace allocated");
        Ok(path)
    }

    /// Fail with `UncommittedChanges` if the workspace holds work that would be lost.
    pub async fn ensure_releasable(&self, ctx: &ExecutionContext) -> Result<(), OrchestrationError> {
        let Some(path) = ctx.workspace_path.as_deref() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        if self.vcs.is_dirty(path).await? || self.vcs.unpushed_commits(path).await? > 0 {
            return Err(OrchestrationError::UncommittedChanges {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Remove the workspace of `task_id`. The branch is kept.
    pub async fn release(&self, task_id: &str, force: bool) -> Result<(), OrchestrationError> {
        let ctx = self
            .registry
            .get(task_id)
            .ok_or_else(|| OrchestrationError::NotFound {
                task_id: task_id.to_string(),
            })?;
        if !force {
            self.ensure_releasable(&ctx).await?;
        }
        let Some(path) = ctx.workspace_path.as_deref() else {
            return Ok(());
        };
        if path.exists() {
            self.vcs.remove_worktree(path, force).await?;
        } else {
            self.vcs.prune_worktrees().await?;
        }
        info!(task_id, path = %path.display(), force, "workspace released");
        Ok(())
    }

    /// Three-way consistency check of directory, branch binding and record.
    /// A single mismatch is healed; anything worse needs a human.
    pub async fn recover(&self, task_id: &str) -> Result<RecoveryOutcome, OrchestrationError> {
        self.vcs.prune_worktrees().await?;
        self.registry.reload()?;

        let snapshot = self.registry.snapshot();
        let record = snapshot.active(task_id).cloned();
        if record.is_none()
            && let Some(archived) = snapshot.latest(task_id)
        {
            return Err(OrchestrationError::TerminalState {
                task_id: task_id.to_string(),
                state: archived.state,
            });
        }

        let worktrees = self.vcs.list_worktrees().await?;
        let diagnosis = self.diagnose(task_id, record.as_ref(), &worktrees).await?;
        info!(task_id, diagnosis = %diagnosis.describe(), "recovery diagnosis");

        let was_recovering = record
            .as_ref()
            .is_some_and(|c| c.state == LifecycleState::Recovering);

        match diagnosis {
            Diagnosis::Healthy => {
                if was_recovering {
                    self.registry.transition(
                        task_id,
                        LifecycleState::Active,
                        Some("consistent again".to_string()),
                    )?;
                    return Ok(RecoveryOutcome::Repaired(
                        "returned to active".to_string(),
                    ));
                }
                Ok(RecoveryOutcome::Healthy)
            }
            Diagnosis::Manual(reason) => Err(OrchestrationError::ManualInterventionRequired {
                task_id: task_id.to_string(),
                reason,
            }),
            Diagnosis::NotFound => Err(OrchestrationError::NotFound {
                task_id: task_id.to_string(),
            }),
            repair => {
                let action = repair.describe();
                let enter_recovering = record
                    .as_ref()
                    .is_some_and(|c| c.state == LifecycleState::Active);
                if enter_recovering {
                    self.registry.transition(
                        task_id,
                        LifecycleState::Recovering,
                        Some(action.clone()),
                    )?;
                }
                self.apply(task_id, repair).await?;
                if enter_recovering || was_recovering {
                    self.registry
                        .transition(task_id, LifecycleState::Active, Some(action.clone()))?;
                }
                info!(task_id, action = %action, "workspace repaired");
                Ok(RecoveryOutcome::Repaired(action))
            }
        }
    }

    async fn diagnose(
        &self,
        task_id: &str,
        record: Option<&ExecutionContext>,
        worktrees: &[WorktreeInfo],
    ) -> Result<Diagnosis, OrchestrationError> {
        let expected = self.workspace_path(task_id);
        let registered = |path: &Path| worktrees.iter().any(|w| same_path(&w.path, path));

        let Some(ctx) = record else {
            if !expected.is_dir() {
                return Ok(Diagnosis::NotFound);
            }
            if !registered(&expected) {
                return Ok(Diagnosis::Manual(format!(
                    "{} exists but is not a registered worktree",
                    expected.display()
                )));
            }
            let Some(branch) = self.vcs.worktree_branch(&expected).await? else {
                return Ok(Diagnosis::Manual(format!(
                    "{} has no branch checked out",
                    expected.display()
                )));
            };
            let role = match self.vcs.read_note(&branch).await {
                Ok(Some(note)) => note.role,
                _ => DEFAULT_ROLE,
            };
            return Ok(Diagnosis::Adopt {
                path: expected,
                branch,
                role,
            });
        };

        let (path, branch) = match (&ctx.workspace_path, &ctx.branch) {
            (Some(path), Some(branch)) => (path.clone(), branch.clone()),
            _ => {
                if !expected.is_dir() {
                    return Ok(Diagnosis::Healthy);
                }
                if !registered(&expected) {
                    return Ok(Diagnosis::Manual(format!(
                        "{} exists but is not a registered worktree",
                        expected.display()
                    )));
                }
                return Ok(match self.vcs.worktree_branch(&expected).await? {
                    Some(branch) => Diagnosis::Bind {
                        path: expected,
                        branch,
                    },
                    None => Diagnosis::Manual(format!(
                        "{} has no branch checked out",
                        expected.display()
                    )),
                });
            }
        };

        if !path.is_dir() {
            return Ok(if self.vcs.branch_exists(&branch).await? {
                Diagnosis::Recreate { path, branch }
            } else {
                Diagnosis::Manual(format!(
                    "workspace {} and branch {} are both missing",
                    path.display(),
                    branch
                ))
            });
        }

        if !registered(&path) {
            return Ok(Diagnosis::Manual(format!(
                "{} exists but is not a registered worktree",
                path.display()
            )));
        }

        let on_disk = self.vcs.worktree_branch(&path).await?;
        if on_disk.as_deref() == Some(branch.as_str()) {
            return Ok(Diagnosis::Healthy);
        }

        let expected_exists = self.vcs.branch_exists(&branch).await?;
        let dirty = self.vcs.is_dirty(&path).await?;
        if expected_exists && !dirty {
            return Ok(Diagnosis::Checkout { path, branch });
        }
        Ok(Diagnosis::Manual(format!(
            "{} is on {} instead of {}{}",
            path.display(),
            on_disk.as_deref().unwrap_or("a detached HEAD"),
            branch,
            if dirty {
                " and has uncommitted changes"
            } else {
                ", which no longer exists"
            }
        )))
    }

    async fn apply(&self, task_id: &str, repair: Diagnosis) -> Result<(), OrchestrationError> {
        match repair {
            Diagnosis::Bind { path, branch } => {
                self.registry.bind_workspace(task_id, &path, &branch)?;
            }
            Diagnosis::Recreate { path, branch } => {
                self.vcs
                    .attach_worktree(&path, &branch)
                    .await
                    .map_err(|source| OrchestrationError::AllocationFailed {
                        branch: branch.clone(),
                        source,
                    })?;
            }
            Diagnosis::Checkout { path, branch } => {
                self.vcs.checkout(&path, &branch).await?;
            }
            Diagnosis::Adopt { path, branch, role } => {
                self.registry.adopt(task_id, role, &path, &branch)?;
            }
            Diagnosis::Healthy | Diagnosis::Manual(_) | Diagnosis::NotFound => {}
        }
        Ok(())
    }
}
