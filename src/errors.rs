//! Typed error hierarchy for the weave orchestrator.
//!
//! Three enums cover the engine and its two external collaborators:
//! - `OrchestrationError`: every public engine operation
//! - `VcsError`: git subprocess and repository failures
//! - `TrackerError`: remote issue tracker failures
//!
//! Every `OrchestrationError` maps to a stable [`ErrorKind`] so calling
//! automation (and the CLI exit code) can branch on it.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::orchestrator::state::LifecycleState;
use crate::retry::Transience;
use crate::role::Role;

/// Stable classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Duplicate active context, branch already bound. Never retried.
    Conflict,
    /// Timeouts, rate limits. Retried with backoff, surfaced once exhausted.
    Transient,
    /// Malformed input, oversized context, missing field.
    Structural,
    /// Workspace/registry/branch disagreement beyond auto-heal.
    Consistency,
    /// Registry or audit log unwritable.
    FatalStorage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::Structural => "structural",
            ErrorKind::Consistency => "consistency",
            ErrorKind::FatalStorage => "fatal_storage",
        }
    }

    /// Process exit code: 2 when a human has to step in, 1 otherwise.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Consistency => 2,
            _ => 1,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the orchestration engine.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Task {task_id} already has an active context (state: {state})")]
    DuplicateActive {
        task_id: String,
        state: LifecycleState,
    },

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Task {task_id} is {state}; terminal contexts cannot be modified")]
    TerminalState {
        task_id: String,
        state: LifecycleState,
    },

    #[error("No execution context found for task {task_id}")]
    NotFound { task_id: String },

    #[error("Branch {branch} already backs a live workspace{}", holder_suffix(.holder))]
    BranchInUse {
        branch: String,
        holder: Option<String>,
    },

    #[error("Workspace allocation failed for branch {branch}: {source}")]
    AllocationFailed {
        branch: String,
        #[source]
        source: VcsError,
    },

    #[error("Workspace {path} has uncommitted or unpushed changes; use --force to discard them")]
    UncommittedChanges { path: PathBuf },

    #[error("Task {task_id} requires manual intervention: {reason}")]
    ManualInterventionRequired { task_id: String, reason: String },

    #[error("Audit log unavailable: {source}")]
    AuditUnavailable {
        #[source]
        source: anyhow::Error,
    },

    #[error("Registry storage unavailable: {source}")]
    StorageUnavailable {
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "Context for task {task_id} is {tokens} tokens, above the hard ceiling of {ceiling}; split the task"
    )]
    ContextTooLarge {
        task_id: String,
        tokens: usize,
        ceiling: usize,
    },

    #[error(
        "Definition of Done incomplete for {role}: {satisfied}/{required} criteria satisfied (threshold {threshold:.2}); missing: {}",
        .missing.join(", ")
    )]
    DoDIncomplete {
        role: Role,
        satisfied: usize,
        required: usize,
        threshold: f64,
        missing: Vec<String>,
    },

    #[error("Task {task_id} has {count} outstanding validation failure(s)")]
    OutstandingValidationFailures { task_id: String, count: usize },

    #[error("Role instructions for {role} not found at {path}")]
    MissingRoleInstructions { role: Role, path: PathBuf },

    #[error("Task {task_id} is missing required field '{field}'")]
    MissingField { task_id: String, field: &'static str },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn holder_suffix(holder: &Option<String>) -> String {
    holder
        .as_ref()
        .map(|task| format!(" (held by task {})", task))
        .unwrap_or_default()
}

impl OrchestrationError {
    pub fn kind(&self) -> ErrorKind {
        use OrchestrationError::*;
        match self {
            DuplicateActive { .. } | BranchInUse { .. } => ErrorKind::Conflict,
            ManualInterventionRequired { .. } => ErrorKind::Consistency,
            AuditUnavailable { .. } | StorageUnavailable { .. } => ErrorKind::FatalStorage,
            AllocationFailed { source, .. } | Vcs(source) => {
                if source.is_transient() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Structural
                }
            }
            Tracker(e) if e.is_transient() => ErrorKind::Transient,
            Cancelled => ErrorKind::Transient,
            _ => ErrorKind::Structural,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

/// Errors from the git collaborator.
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git {command} timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Failed to spawn git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Repository error: {0}")]
    Repository(#[from] git2::Error),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Malformed {what}: {message}")]
    Malformed { what: String, message: String },

    #[error("Path {0} is not valid UTF-8")]
    InvalidPath(PathBuf),
}

impl Transience for VcsError {
    /// Timeouts and ref/index lock contention clear up on their own; anything
    /// else (bad ref, permission denied, disk full) will fail the same way again.
    fn is_transient(&self) -> bool {
        match self {
            VcsError::Timeout { .. } => true,
            VcsError::CommandFailed { stderr, .. } => {
                let stderr = stderr.to_lowercase();
                stderr.contains("index.lock")
                    || (stderr.contains("unable to create") && stderr.contains(".lock"))
                    || stderr.contains("could not lock")
            }
            VcsError::Repository(e) => e.code() == git2::ErrorCode::Locked,
            _ => false,
        }
    }
}

/// Errors from the remote issue tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Tracker unreachable: {0}")]
    Unavailable(String),

    #[error("Tracker rate limit hit")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Tracker rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Tracker not configured: {0}")]
    NotConfigured(String),
}

impl Transience for TrackerError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            TrackerError::Unavailable(_) | TrackerError::RateLimited { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            TrackerError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
