//! Orchestration engine: registry, isolation and the facade tying them to
//! the audit log, the gate and the context assembler.

pub mod engine;
pub mod isolation;
pub mod state;

pub use engine::{CompletionOutcome, Orchestrator, SpawnOutcome, SpawnRequest, StatusEntry, ValidationReport};
pub use isolation::{IsolationManager, RecoveryOutcome};
pub use state::{ExecutionContext, LifecycleState, Registry};

use std::sync::Arc;

use crate::audit::{AuditAction, AuditLog};
use state::{Change, CommitHook, RegistryEvent};

/// Audit action and result text for a registry change, or `None` for
/// bookkeeping that is not audited on its own.
pub fn audit_record(event: &RegistryEvent) -> Option<(AuditAction, String)> {
    use LifecycleState::*;
    match &event.change {
        Change::Registered { adopted: false } => {
            Some((AuditAction::Registered, format!("role={}", event.role)))
        }
        Change::Registered { adopted: true } => Some((
            AuditAction::Recovered,
            format!("re-registered from workspace as {}", event.role),
        )),
        Change::Transitioned { from, to, reason } => {
            let action = match (from, to) {
                (Recovering, _) | (_, Recovering) => AuditAction::Recovered,
                (_, Active) => AuditAction::Activated,
                (_, AwaitingHandoff) => AuditAction::Handoff,
                (_, Completed) => AuditAction::Completed,
                (_, Failed) => AuditAction::Failed,
                (_, Created) => return None,
            };
            let mut result = format!("{} -> {}", from, to);
            if let Some(reason) = reason {
                result.push_str(": ");
                result.push_str(reason);
            }
            Some((action, result))
        }
        Change::WorkspaceBound { path, branch } => Some((
            AuditAction::Allocated,
            format!("{} at {}", branch, path.display()),
        )),
        Change::Escalated { idle_hours } => Some((
            AuditAction::Escalated,
            format!("idle {:.1}h", idle_hours),
        )),
        Change::ValidationRecorded { failures } => Some((
            AuditAction::Validated,
            if failures.is_empty() {
                "passed".to_string()
            } else {
                format!("{} failure(s): {}", failures.len(), failures.join("; "))
            },
        )),
        Change::ActivityRecorded | Change::ErrorRecorded { .. } => None,
    }
}

/// Commit hook that appends the audit entry for each change before the
/// registry persists it. A failed append aborts the change.
pub fn audit_hook(audit: Arc<AuditLog>, actor: String) -> CommitHook {
    Box::new(move |event: &RegistryEvent| {
        if let Some((action, result)) = audit_record(event) {
            audit.append(&actor, action, Some(&event.task_id), &result)?;
        }
        Ok(())
    })
}
