//! Ownership registry: the durable record of every execution context.
//!
//! Reads come from the last committed in-memory snapshot. Writes go through a
//! single writer (process mutex plus `registry.lock` across processes) that
//! reloads the file under the lock, applies the mutation to a copy, runs the
//! commit hook, persists atomically and only then publishes the new snapshot.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::errors::OrchestrationError;
use crate::role::Role;
use crate::util::{FileLock, atomic_write};

const REGISTRY_VERSION: u32 = 1;

/// Lifecycle of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Active,
    AwaitingHandoff,
    Recovering,
    Completed,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Active => "active",
            LifecycleState::AwaitingHandoff => "awaiting_handoff",
            LifecycleState::Recovering => "recovering",
            LifecycleState::Completed => "completed",
            LifecycleState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Completed | LifecycleState::Failed)
    }

    /// Edges of the lifecycle graph. `Failed` is reachable from every
    /// non-terminal state; terminal states have no outgoing edges.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Created, Active) => true,
            (Active, AwaitingHandoff) | (Active, Recovering) => true,
            (AwaitingHandoff, Completed) => true,
            (Recovering, Active) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "created" => Ok(LifecycleState::Created),
            "active" => Ok(LifecycleState::Active),
            "awaiting_handoff" => Ok(LifecycleState::AwaitingHandoff),
            "recovering" => Ok(LifecycleState::Recovering),
            "completed" => Ok(LifecycleState::Completed),
            "failed" => Ok(LifecycleState::Failed),
            _ => anyhow::bail!(
                "Invalid state '{}'. Valid values: created, active, awaiting_handoff, recovering, completed, failed",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub commit_count: u32,
    pub files_changed: u32,
}

/// One SubAgent execution, identified by (task id, role).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub task_id: String,
    pub role: Role,
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_failures: Vec<String>,
    /// Activity timestamp a stuck escalation was already emitted for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_for: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_type: Option<String>,
    /// Definition of Done checklist accepted at handoff, criterion -> satisfied.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub handoff_checklist: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    pub fn new(task_id: &str, role: Role) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.to_string(),
            role,
            state: LifecycleState::Created,
            workspace_path: None,
            branch: None,
            created_at: now,
            last_activity: now,
            metrics: Metrics::default(),
            errors: Vec::new(),
            validation_failures: Vec::new(),
            escalated_for: None,
            title: None,
            issue_type: None,
            handoff_checklist: BTreeMap::new(),
            finished_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn has_workspace(&self) -> bool {
        self.workspace_path.is_some() && self.branch.is_some()
    }
}

/// Registry file contents: every context ever registered, terminal ones as history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub version: u32,
    pub contexts: Vec<ExecutionContext>,
}

impl RegistrySnapshot {
    /// The non-terminal context for `task_id`, if any.
    pub fn active(&self, task_id: &str) -> Option<&ExecutionContext> {
        self.contexts
            .iter()
            .find(|c| c.task_id == task_id && !c.state.is_terminal())
    }

    fn active_mut(&mut self, task_id: &str) -> Option<&mut ExecutionContext> {
        self.contexts
            .iter_mut()
            .find(|c| c.task_id == task_id && !c.state.is_terminal())
    }

    /// The active context for `task_id`, else its most recent archived one.
    pub fn latest(&self, task_id: &str) -> Option<&ExecutionContext> {
        self.active(task_id)
            .or_else(|| self.contexts.iter().rev().find(|c| c.task_id == task_id))
    }

    /// Which task's live workspace is on `branch`.
    pub fn branch_holder(&self, branch: &str) -> Option<&ExecutionContext> {
        self.contexts
            .iter()
            .find(|c| !c.state.is_terminal() && c.branch.as_deref() == Some(branch))
    }

    /// Mutable access to the active context, or the error a caller should see.
    fn require_active(&mut self, task_id: &str) -> Result<&mut ExecutionContext, OrchestrationError> {
        if self.active(task_id).is_none() {
            return Err(match self.latest(task_id) {
                Some(archived) => OrchestrationError::TerminalState {
                    task_id: task_id.to_string(),
                    state: archived.state,
                },
                None => OrchestrationError::NotFound {
                    task_id: task_id.to_string(),
                },
            });
        }
        self.active_mut(task_id).ok_or_else(|| OrchestrationError::NotFound {
            task_id: task_id.to_string(),
        })
    }
}

/// What a committed mutation changed, handed to the commit hook.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Registered { adopted: bool },
    Transitioned {
        from: LifecycleState,
        to: LifecycleState,
        reason: Option<String>,
    },
    WorkspaceBound { path: PathBuf, branch: String },
    ActivityRecorded,
    Escalated { idle_hours: f64 },
    ValidationRecorded { failures: Vec<String> },
    ErrorRecorded { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEvent {
    pub task_id: String,
    pub role: Role,
    pub change: Change,
}

/// Called with every change before it is persisted. An error aborts the
/// mutation and nothing is written.
pub type CommitHook = Box<dyn Fn(&RegistryEvent) -> Result<(), OrchestrationError> + Send + Sync>;

/// Activity figures refreshed from the VCS.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityUpdate {
    pub metrics: Metrics,
    pub last_commit: Option<DateTime<Utc>>,
}

pub struct Registry {
    path: PathBuf,
    lock_path: PathBuf,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    writer: Mutex<()>,
    hook: Option<CommitHook>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("path", &self.path)
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}

fn storage(source: anyhow::Error) -> OrchestrationError {
    OrchestrationError::StorageUnavailable { source }
}

impl Registry {
    /// Open the registry at `path`, quarantining an unreadable file.
    pub fn open(path: &Path, lock_path: &Path) -> Result<Self, OrchestrationError> {
        let snapshot = load_or_quarantine(path).map_err(storage)?;
        Ok(Self {
            path: path.to_path_buf(),
            lock_path: lock_path.to_path_buf(),
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
            hook: None,
        })
    }

    pub fn with_commit_hook(mut self, hook: CommitHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// The last committed snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Pick up changes written by other processes.
    pub fn reload(&self) -> Result<(), OrchestrationError> {
        let fresh = load_or_quarantine(&self.path).map_err(storage)?;
        self.publish(fresh);
        Ok(())
    }

    fn publish(&self, snapshot: RegistrySnapshot) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
    }

    pub fn get(&self, task_id: &str) -> Option<ExecutionContext> {
        self.snapshot().latest(task_id).cloned()
    }

    pub fn list_active(&self) -> Vec<ExecutionContext> {
        self.snapshot()
            .contexts
            .iter()
            .filter(|c| !c.state.is_terminal())
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<ExecutionContext> {
        self.snapshot().contexts.clone()
    }

    /// Run one mutation through the single-writer protocol.
    fn commit<T>(
        &self,
        op: impl FnOnce(&mut RegistrySnapshot) -> Result<(T, Option<RegistryEvent>), OrchestrationError>,
    ) -> Result<T, OrchestrationError> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let _lock = FileLock::acquire(&self.lock_path).map_err(storage)?;

        let mut next = load_or_quarantine(&self.path).map_err(storage)?;
        let (value, event) = op(&mut next)?;

        if let Some(event) = &event {
            if let Some(hook) = &self.hook {
                hook(event)?;
            }
            debug!(task_id = %event.task_id, change = ?event.change, "registry commit");
        }

        persist(&self.path, &next).map_err(storage)?;
        self.publish(next);
        Ok(value)
    }

    /// Create a new context in `Created`. At most one non-terminal context per task.
    pub fn register(
        &self,
        task_id: &str,
        role: Role,
        title: Option<String>,
        issue_type: Option<String>,
    ) -> Result<ExecutionContext, OrchestrationError> {
        if task_id.trim().is_empty() {
            return Err(OrchestrationError::InvalidInput(
                "task id must not be empty".to_string(),
            ));
        }
        self.commit(|snap| {
            if let Some(existing) = snap.active(task_id) {
                return Err(OrchestrationError::DuplicateActive {
                    task_id: task_id.to_string(),
                    state: existing.state,
                });
            }
            let mut ctx = ExecutionContext::new(task_id, role);
            ctx.title = title;
            ctx.issue_type = issue_type;
            snap.contexts.push(ctx.clone());
            let event = RegistryEvent {
                task_id: task_id.to_string(),
                role,
                change: Change::Registered { adopted: false },
            };
            Ok((ctx, Some(event)))
        })
    }

    /// Re-create a record for a workspace found on disk, directly in `Active`.
    pub fn adopt(
        &self,
        task_id: &str,
        role: Role,
        path: &Path,
        branch: &str,
    ) -> Result<ExecutionContext, OrchestrationError> {
        self.commit(|snap| {
            if let Some(existing) = snap.active(task_id) {
                return Err(OrchestrationError::DuplicateActive {
                    task_id: task_id.to_string(),
                    state: existing.state,
                });
            }
            let mut ctx = ExecutionContext::new(task_id, role);
            ctx.state = LifecycleState::Active;
            ctx.workspace_path = Some(path.to_path_buf());
            ctx.branch = Some(branch.to_string());
            snap.contexts.push(ctx.clone());
            let event = RegistryEvent {
                task_id: task_id.to_string(),
                role,
                change: Change::Registered { adopted: true },
            };
            Ok((ctx, Some(event)))
        })
    }

    /// Move the active context of `task_id` to `to`.
    pub fn transition(
        &self,
        task_id: &str,
        to: LifecycleState,
        reason: Option<String>,
    ) -> Result<ExecutionContext, OrchestrationError> {
        self.commit(|snap| {
            let ctx = snap.require_active(task_id)?;
            let from = ctx.state;
            if !from.can_transition_to(to) {
                return Err(OrchestrationError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from,
                    to,
                });
            }
            if from == LifecycleState::Created && to == LifecycleState::Active && !ctx.has_workspace()
            {
                return Err(OrchestrationError::MissingField {
                    task_id: task_id.to_string(),
                    field: "workspace",
                });
            }

            ctx.state = to;
            ctx.touch();
            if to.is_terminal() {
                ctx.finished_at = Some(ctx.last_activity);
            }
            if to == LifecycleState::Failed
                && let Some(reason) = &reason
            {
                ctx.errors.push(reason.clone());
            }

            let event = RegistryEvent {
                task_id: task_id.to_string(),
                role: ctx.role,
                change: Change::Transitioned { from, to, reason },
            };
            Ok((ctx.clone(), Some(event)))
        })
    }

    /// `Active -> AwaitingHandoff`, storing the checklist the gate accepted.
    pub fn hand_off(
        &self,
        task_id: &str,
        checklist: BTreeMap<String, bool>,
        reason: String,
    ) -> Result<ExecutionContext, OrchestrationError> {
        self.commit(|snap| {
            let ctx = snap.require_active(task_id)?;
            let from = ctx.state;
            let to = LifecycleState::AwaitingHandoff;
            if from != LifecycleState::Active {
                return Err(OrchestrationError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from,
                    to,
                });
            }
            ctx.state = to;
            ctx.handoff_checklist = checklist;
            ctx.touch();
            let event = RegistryEvent {
                task_id: task_id.to_string(),
                role: ctx.role,
                change: Change::Transitioned {
                    from,
                    to,
                    reason: Some(reason),
                },
            };
            Ok((ctx.clone(), Some(event)))
        })
    }

    /// Move the context to a terminal state, keeping the record as history.
    pub fn retire(
        &self,
        task_id: &str,
        outcome: LifecycleState,
        reason: Option<String>,
    ) -> Result<ExecutionContext, OrchestrationError> {
        if !outcome.is_terminal() {
            return Err(OrchestrationError::InvalidInput(format!(
                "retire needs a terminal state, got {}",
                outcome
            )));
        }
        self.transition(task_id, outcome, reason)
    }

    pub fn bind_workspace(
        &self,
        task_id: &str,
        path: &Path,
        branch: &str,
    ) -> Result<ExecutionContext, OrchestrationError> {
        self.commit(|snap| {
            if let Some(holder) = snap.branch_holder(branch)
                && holder.task_id != task_id
            {
                return Err(OrchestrationError::BranchInUse {
                    branch: branch.to_string(),
                    holder: Some(holder.task_id.clone()),
                });
            }
            let ctx = snap.require_active(task_id)?;
            ctx.workspace_path = Some(path.to_path_buf());
            ctx.branch = Some(branch.to_string());
            ctx.touch();
            let event = RegistryEvent {
                task_id: task_id.to_string(),
                role: ctx.role,
                change: Change::WorkspaceBound {
                    path: path.to_path_buf(),
                    branch: branch.to_string(),
                },
            };
            Ok((ctx.clone(), Some(event)))
        })
    }

    /// Refresh metrics; `last_activity` only ever moves forward.
    pub fn record_activity(
        &self,
        task_id: &str,
        update: ActivityUpdate,
    ) -> Result<ExecutionContext, OrchestrationError> {
        self.commit(|snap| {
            let ctx = snap.require_active(task_id)?;
            let changed = ctx.metrics != update.metrics
                || update.last_commit.is_some_and(|t| t > ctx.last_activity);
            ctx.metrics = update.metrics;
            if let Some(last_commit) = update.last_commit
                && last_commit > ctx.last_activity
            {
                ctx.last_activity = last_commit;
            }
            let event = changed.then(|| RegistryEvent {
                task_id: task_id.to_string(),
                role: ctx.role,
                change: Change::ActivityRecorded,
            });
            Ok((ctx.clone(), event))
        })
    }

    /// Remember that the breach for activity time `for_activity` was escalated.
    pub fn mark_escalated(
        &self,
        task_id: &str,
        for_activity: DateTime<Utc>,
        idle_hours: f64,
    ) -> Result<ExecutionContext, OrchestrationError> {
        self.commit(|snap| {
            let ctx = snap.require_active(task_id)?;
            ctx.escalated_for = Some(for_activity);
            let event = RegistryEvent {
                task_id: task_id.to_string(),
                role: ctx.role,
                change: Change::Escalated { idle_hours },
            };
            Ok((ctx.clone(), Some(event)))
        })
    }

    /// Replace the outstanding validation failures (empty clears them).
    pub fn record_validation(
        &self,
        task_id: &str,
        failures: Vec<String>,
    ) -> Result<ExecutionContext, OrchestrationError> {
        self.commit(|snap| {
            let ctx = snap.require_active(task_id)?;
            ctx.validation_failures = failures.clone();
            ctx.touch();
            let event = RegistryEvent {
                task_id: task_id.to_string(),
                role: ctx.role,
                change: Change::ValidationRecorded { failures },
            };
            Ok((ctx.clone(), Some(event)))
        })
    }

    pub fn record_error(
        &self,
        task_id: &str,
        message: &str,
    ) -> Result<ExecutionContext, OrchestrationError> {
        self.commit(|snap| {
            let ctx = snap.require_active(task_id)?;
            ctx.errors.push(message.to_string());
            let event = RegistryEvent {
                task_id: task_id.to_string(),
                role: ctx.role,
                change: Change::ErrorRecorded {
                    message: message.to_string(),
                },
            };
            Ok((ctx.clone(), Some(event)))
        })
    }
}

fn load_or_quarantine(path: &Path) -> Result<RegistrySnapshot> {
    let content = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RegistrySnapshot {
                version: REGISTRY_VERSION,
                contexts: Vec::new(),
            });
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    match serde_json::from_slice::<RegistrySnapshot>(&content) {
        Ok(snapshot) if snapshot.version <= REGISTRY_VERSION => Ok(snapshot),
        Ok(snapshot) => {
            quarantine(path, &format!("unsupported version {}", snapshot.version))?;
            Ok(RegistrySnapshot {
                version: REGISTRY_VERSION,
                contexts: Vec::new(),
            })
        }
        Err(e) => {
            quarantine(path, &e.to_string())?;
            Ok(RegistrySnapshot {
                version: REGISTRY_VERSION,
                contexts: Vec::new(),
            })
        }
    }
}

fn quarantine(path: &Path, reason: &str) -> Result<PathBuf> {
    let aside = PathBuf::from(format!(
        "{}.corrupt-{}",
        path.display(),
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
    ));
    std::fs::rename(path, &aside)
        .with_context(|| format!("Failed to quarantine {}", path.display()))?;
    warn!(
        path = %path.display(),
        quarantined = %aside.display(),
        reason,
        "registry file unreadable; moved aside and starting empty"
    );
    Ok(aside)
}

fn persist(path: &Path, snapshot: &RegistrySnapshot) -> Result<()> {
    let json = serde_json::to_vec_pretty(snapshot).context("Failed to serialize registry")?;
    atomic_write(path, &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (Registry, TempDir) {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(
            &dir.path().join("registry.json"),
            &dir.path().join("registry.lock"),
        )
        .unwrap();
        (registry, dir)
    }

    fn bind(registry: &Registry, task_id: &str) {
        registry
            .bind_workspace(
                task_id,
                Path::new(&format!("/tmp/w/{}", task_id)),
                &format!("task-{}", task_id),
            )
            .unwrap();
    }

    #[test]
    fn test_lifecycle_edges() {
        use LifecycleState::*;
        assert!(Created.can_transition_to(Active));
        assert!(Active.can_transition_to(AwaitingHandoff));
        assert!(AwaitingHandoff.can_transition_to(Completed));
        assert!(Active.can_transition_to(Recovering));
        assert!(Recovering.can_transition_to(Active));
        assert!(Recovering.can_transition_to(Failed));
        assert!(Created.can_transition_to(Failed));
        assert!(!Created.can_transition_to(Completed));
        assert!(!Active.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Active));
    }

    #[test]
    fn test_register_twice_is_duplicate_active() {
        let (registry, _dir) = setup();
        registry.register("42", Role::Engineer, None, None).unwrap();
        let err = registry
            .register("42", Role::Reviewer, None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::DuplicateActive { ref task_id, state: LifecycleState::Created } if task_id == "42"
        ));
    }

    #[test]
    fn test_register_after_terminal_is_allowed() {
        let (registry, _dir) = setup();
        registry.register("42", Role::Engineer, None, None).unwrap();
        registry
            .retire("42", LifecycleState::Failed, Some("abandoned".into()))
            .unwrap();
        let again = registry.register("42", Role::Reviewer, None, None).unwrap();
        assert_eq!(again.role, Role::Reviewer);
        assert_eq!(registry.list_all().len(), 2);
        assert_eq!(registry.list_active().len(), 1);
    }

    #[test]
    fn test_created_to_active_requires_workspace() {
        let (registry, _dir) = setup();
        registry.register("1", Role::Engineer, None, None).unwrap();
        let err = registry
            .transition("1", LifecycleState::Active, None)
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::MissingField { field: "workspace", .. }));

        bind(&registry, "1");
        let ctx = registry
            .transition("1", LifecycleState::Active, None)
            .unwrap();
        assert_eq!(ctx.state, LifecycleState::Active);
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let (registry, _dir) = setup();
        registry.register("1", Role::Engineer, None, None).unwrap();
        let err = registry
            .transition("1", LifecycleState::Completed, None)
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::InvalidTransition {
                from: LifecycleState::Created,
                to: LifecycleState::Completed,
                ..
            }
        ));
        assert_eq!(registry.get("1").unwrap().state, LifecycleState::Created);
    }

    #[test]
    fn test_terminal_context_rejects_mutation() {
        let (registry, _dir) = setup();
        registry.register("1", Role::Engineer, None, None).unwrap();
        let failed = registry
            .retire("1", LifecycleState::Failed, Some("boom".into()))
            .unwrap();
        assert_eq!(failed.errors, vec!["boom".to_string()]);
        assert!(failed.finished_at.is_some());

        let err = registry.record_error("1", "late").unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::TerminalState { state: LifecycleState::Failed, .. }
        ));
        let err = registry.record_error("nope", "late").unwrap_err();
        assert!(matches!(err, OrchestrationError::NotFound { .. }));
    }

    #[test]
    fn test_state_survives_reopen() {
        let (registry, dir) = setup();
        registry
            .register("7", Role::Architect, Some("Design auth".into()), Some("feature".into()))
            .unwrap();
        bind(&registry, "7");
        drop(registry);

        let reopened = Registry::open(
            &dir.path().join("registry.json"),
            &dir.path().join("registry.lock"),
        )
        .unwrap();
        let ctx = reopened.get("7").unwrap();
        assert_eq!(ctx.role, Role::Architect);
        assert_eq!(ctx.branch.as_deref(), Some("task-7"));
        assert_eq!(ctx.title.as_deref(), Some("Design auth"));
    }

    #[test]
    fn test_corrupt_file_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "{ not json").unwrap();

        let registry = Registry::open(&path, &dir.path().join("registry.lock")).unwrap();
        assert!(registry.list_all().is_empty());
        assert!(!path.exists());
        let quarantined: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("registry.json.corrupt-")
            })
            .collect();
        assert_eq!(quarantined.len(), 1);

        registry.register("1", Role::Engineer, None, None).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_failing_commit_hook_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let registry = Registry::open(&path, &dir.path().join("registry.lock"))
            .unwrap()
            .with_commit_hook(Box::new(|_: &RegistryEvent| {
                Err(OrchestrationError::AuditUnavailable {
                    source: anyhow::anyhow!("disk full"),
                })
            }));

        let err = registry
            .register("1", Role::Engineer, None, None)
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::AuditUnavailable { .. }));
        assert!(registry.get("1").is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_commit_hook_sees_transitions() {
        let dir = TempDir::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let registry = Registry::open(
            &dir.path().join("registry.json"),
            &dir.path().join("registry.lock"),
        )
        .unwrap()
        .with_commit_hook(Box::new(move |event: &RegistryEvent| {
            sink.lock().unwrap().push(event.change.clone());
            Ok(())
        }));

        registry.register("1", Role::Engineer, None, None).unwrap();
        bind(&registry, "1");
        registry
            .transition("1", LifecycleState::Active, None)
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], Change::Registered { adopted: false });
        assert!(matches!(seen[1], Change::WorkspaceBound { .. }));
        assert_eq!(
            seen[2],
            Change::Transitioned {
                from: LifecycleState::Created,
                to: LifecycleState::Active,
                reason: None
            }
        );
    }

    #[test]
    fn test_bind_rejects_branch_held_by_other_task() {
        let (registry, _dir) = setup();
        registry.register("42", Role::Engineer, None, None).unwrap();
        registry.register("43", Role::Engineer, None, None).unwrap();
        registry
            .bind_workspace("42", Path::new("/w/42"), "task-42")
            .unwrap();
        let err = registry
            .bind_workspace("43", Path::new("/w/43"), "task-42")
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::BranchInUse { holder: Some(ref h), .. } if h == "42"
        ));
    }

    #[test]
    fn test_record_activity_never_moves_backwards() {
        let (registry, _dir) = setup();
        let ctx = registry.register("1", Role::Engineer, None, None).unwrap();
        let older = ctx.last_activity - chrono::Duration::hours(3);
        let updated = registry
            .record_activity(
                "1",
                ActivityUpdate {
                    metrics: Metrics {
                        commit_count: 2,
                        files_changed: 5,
                    },
                    last_commit: Some(older),
                },
            )
            .unwrap();
        assert_eq!(updated.last_activity, ctx.last_activity);
        assert_eq!(updated.metrics.commit_count, 2);
    }

    #[test]
    fn test_validation_failures_replace_and_clear() {
        let (registry, _dir) = setup();
        registry.register("1", Role::Engineer, None, None).unwrap();
        registry
            .record_validation("1", vec!["missing acceptance criteria".into()])
            .unwrap();
        assert_eq!(registry.get("1").unwrap().validation_failures.len(), 1);
        registry.record_validation("1", Vec::new()).unwrap();
        assert!(registry.get("1").unwrap().validation_failures.is_empty());
    }

    #[test]
    fn test_concurrent_register_admits_exactly_one() {
        let (registry, _dir) = setup();
        let registry = Arc::new(registry);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .register("race", Role::Engineer, None, None)
                        .is_ok()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(registry.list_active().len(), 1);
    }

    #[test]
    fn test_second_handle_sees_first_handles_writes() {
        let (first, dir) = setup();
        let second = Registry::open(
            &dir.path().join("registry.json"),
            &dir.path().join("registry.lock"),
        )
        .unwrap();
        first.register("1", Role::Engineer, None, None).unwrap();

        // Writers reload under the lock, so the duplicate is caught.
        let err = second.register("1", Role::Engineer, None, None).unwrap_err();
        assert!(matches!(err, OrchestrationError::DuplicateActive { .. }));

        assert!(second.get("1").is_none());
        second.reload().unwrap();
        assert!(second.get("1").is_some());
    }

    #[test]
    fn test_hand_off_stores_checklist() {
        let (registry, _dir) = setup();
        registry.register("9", Role::Reviewer, None, None).unwrap();
        bind(&registry, "9");
        registry.transition("9", LifecycleState::Active, None).unwrap();

        let checklist = BTreeMap::from([("review_doc".to_string(), true)]);
        let ctx = registry
            .hand_off("9", checklist.clone(), "DoD 1/1".to_string())
            .unwrap();
        assert_eq!(ctx.state, LifecycleState::AwaitingHandoff);
        assert_eq!(ctx.handoff_checklist, checklist);

        let err = registry
            .hand_off("9", BTreeMap::new(), "again".to_string())
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidTransition { .. }));
    }
}
