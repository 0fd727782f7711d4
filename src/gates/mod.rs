//! Validation gate: entry/exit criteria on lifecycle transitions.
//!
//! The registry enforces which edges exist; the gate decides whether a
//! context has earned the edge it asks for.

pub mod checks;
pub mod dod;

pub use checks::{Certificate, CheckResult, PreExecutionFacts};
pub use dod::{DodCriterion, DodEvaluation, DodEvidence};

use std::collections::BTreeMap;

use crate::errors::OrchestrationError;
use crate::orchestrator::state::{ExecutionContext, LifecycleState};
use crate::role::Role;
use crate::weave_config::GatesSection;

#[derive(Debug, Clone, Default)]
pub struct ValidationGate {
    gates: GatesSection,
}

impl ValidationGate {
    pub fn new(gates: GatesSection) -> Self {
        Self { gates }
    }

    pub fn threshold(&self, role: Role) -> f64 {
        self.gates.threshold_for(role)
    }

    fn require_state(
        ctx: &ExecutionContext,
        expected: LifecycleState,
        to: LifecycleState,
    ) -> Result<(), OrchestrationError> {
        if ctx.state.is_terminal() {
            return Err(OrchestrationError::TerminalState {
                task_id: ctx.task_id.clone(),
                state: ctx.state,
            });
        }
        if ctx.state != expected {
            return Err(OrchestrationError::InvalidTransition {
                task_id: ctx.task_id.clone(),
                from: ctx.state,
                to,
            });
        }
        Ok(())
    }

    /// `Created -> Active` needs an allocated workspace.
    pub fn check_activation(&self, ctx: &ExecutionContext) -> Result<(), OrchestrationError> {
        Self::require_state(ctx, LifecycleState::Created, LifecycleState::Active)?;
        if !ctx.has_workspace() {
            return Err(OrchestrationError::MissingField {
                task_id: ctx.task_id.clone(),
                field: "workspace",
            });
        }
        Ok(())
    }

    /// `Active -> AwaitingHandoff` needs the role's Definition of Done ratio
    /// at or above its threshold.
    pub fn check_handoff(
        &self,
        ctx: &ExecutionContext,
        evidence: &DodEvidence,
    ) -> Result<DodEvaluation, OrchestrationError> {
        Self::require_state(ctx, LifecycleState::Active, LifecycleState::AwaitingHandoff)?;
        let evaluation = dod::evaluate(ctx.role, evidence, self.threshold(ctx.role))?;
        if !evaluation.passed() {
            return Err(evaluation.to_error());
        }
        Ok(evaluation)
    }

    /// `AwaitingHandoff -> Completed` needs no outstanding validation failures.
    pub fn check_completion(&self, ctx: &ExecutionContext) -> Result<(), OrchestrationError> {
        Self::require_state(ctx, LifecycleState::AwaitingHandoff, LifecycleState::Completed)?;
        if !ctx.validation_failures.is_empty() {
            return Err(OrchestrationError::OutstandingValidationFailures {
                task_id: ctx.task_id.clone(),
                count: ctx.validation_failures.len(),
            });
        }
        Ok(())
    }
}

impl DodEvaluation {
    /// Every criterion of the role with whether it was satisfied.
    pub fn checklist(&self) -> BTreeMap<String, bool> {
        self.satisfied
            .iter()
            .map(|c| (c.to_string(), true))
            .chain(self.missing.iter().map(|c| (c.to_string(), false)))
            .collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "DoD {}/{} (threshold {:.2})",
            self.satisfied.len(),
            self.required(),
            self.threshold
        )
    }
}
