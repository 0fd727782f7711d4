//! Definition of Done: per-role enumerated criteria and structured evidence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::OrchestrationError;
use crate::role::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DodCriterion {
    // pm
    PrdExists,
    ChildIssues,
    AcceptanceCriteria,
    SuccessMetrics,
    Timeline,
    // architect
    AdrExists,
    SpecExists,
    OptionsDocumented,
    DecisionRationale,
    NoCodeExamples,
    // engineer
    CodeCommitted,
    TestsWritten,
    TestsPassing,
    DocsUpdated,
    NoLintErrors,
    SecurityScan,
    // reviewer
    ReviewDoc,
    ChecklistVerified,
    DecisionDocumented,
    FeedbackProvided,
    // ux
    UxDoc,
    Wireframes,
    UserFlows,
    Accessibility,
}

const PM: &[DodCriterion] = &[
    DodCriterion::PrdExists,
    DodCriterion::ChildIssues,
    DodCriterion::AcceptanceCriteria,
    DodCriterion::SuccessMetrics,
    DodCriterion::Timeline,
];

const ARCHITECT: &[DodCriterion] = &[
    DodCriterion::AdrExists,
    DodCriterion::SpecExists,
    DodCriterion::OptionsDocumented,
    DodCriterion::DecisionRationale,
    DodCriterion::NoCodeExamples,
];

const ENGINEER: &[DodCriterion] = &[
    DodCriterion::CodeCommitted,
    DodCriterion::TestsWritten,
    DodCriterion::TestsPassing,
    DodCriterion::DocsUpdated,
    DodCriterion::NoLintErrors,
    DodCriterion::SecurityScan,
];

const REVIEWER: &[DodCriterion] = &[
    DodCriterion::ReviewDoc,
    DodCriterion::ChecklistVerified,
    DodCriterion::DecisionDocumented,
    DodCriterion::FeedbackProvided,
];

const UX: &[DodCriterion] = &[
    DodCriterion::UxDoc,
    DodCriterion::Wireframes,
    DodCriterion::UserFlows,
    DodCriterion::Accessibility,
];

const ALL: &[&[DodCriterion]] = &[PM, ARCHITECT, ENGINEER, REVIEWER, UX];

impl DodCriterion {
    /// The checklist for `role`.
    pub fn for_role(role: Role) -> &'static [DodCriterion] {
        match role {
            Role::Pm => PM,
            Role::Architect => ARCHITECT,
            Role::Engineer => ENGINEER,
            Role::Reviewer => REVIEWER,
            Role::Ux => UX,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DodCriterion::PrdExists => "prd_exists",
            DodCriterion::ChildIssues => "child_issues",
            DodCriterion::AcceptanceCriteria => "acceptance_criteria",
            DodCriterion::SuccessMetrics => "success_metrics",
            DodCriterion::Timeline => "timeline",
            DodCriterion::AdrExists => "adr_exists",
            DodCriterion::SpecExists => "spec_exists",
            DodCriterion::OptionsDocumented => "options_documented",
            DodCriterion::DecisionRationale => "decision_rationale",
            DodCriterion::NoCodeExamples => "no_code_examples",
            DodCriterion::CodeCommitted => "code_committed",
            DodCriterion::TestsWritten => "tests_written",
            DodCriterion::TestsPassing => "tests_passing",
            DodCriterion::DocsUpdated => "docs_updated",
            DodCriterion::NoLintErrors => "no_lint_errors",
            DodCriterion::SecurityScan => "security_scan",
            DodCriterion::ReviewDoc => "review_doc",
            DodCriterion::ChecklistVerified => "checklist_verified",
            DodCriterion::DecisionDocumented => "decision_documented",
            DodCriterion::FeedbackProvided => "feedback_provided",
            DodCriterion::UxDoc => "ux_doc",
            DodCriterion::Wireframes => "wireframes",
            DodCriterion::UserFlows => "user_flows",
            DodCriterion::Accessibility => "accessibility",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            DodCriterion::PrdExists => "PRD created at docs/prd/PRD-<task>.md",
            DodCriterion::ChildIssues => "Child issues created (features/stories)",
            DodCriterion::AcceptanceCriteria => "Acceptance criteria defined",
            DodCriterion::SuccessMetrics => "Success metrics specified",
            DodCriterion::Timeline => "Timeline with phases documented",
            DodCriterion::AdrExists => "ADR created at docs/adr/ADR-<task>.md",
            DodCriterion::SpecExists => "Tech spec at docs/specs/SPEC-<task>.md",
            DodCriterion::OptionsDocumented => "Options with pros/cons documented",
            DodCriterion::DecisionRationale => "Decision rationale clear",
            DodCriterion::NoCodeExamples => "No code examples (diagrams only)",
            DodCriterion::CodeCommitted => "Code committed",
            DodCriterion::TestsWritten => "Tests written",
            DodCriterion::TestsPassing => "Tests passing",
            DodCriterion::DocsUpdated => "Documentation updated",
            DodCriterion::NoLintErrors => "No compiler warnings or linter errors",
            DodCriterion::SecurityScan => "Security scan passed",
            DodCriterion::ReviewDoc => "Review document at docs/reviews/REVIEW-<task>.md",
            DodCriterion::ChecklistVerified => "All checklist items verified",
            DodCriterion::DecisionDocumented => "Approval or rejection documented",
            DodCriterion::FeedbackProvided => "Feedback provided for rejections",
            DodCriterion::UxDoc => "UX design at docs/ux/UX-<task>.md",
            DodCriterion::Wireframes => "Wireframes complete",
            DodCriterion::UserFlows => "User flows documented",
            DodCriterion::Accessibility => "Accessibility considered",
        }
    }

    /// Document whose presence satisfies this criterion, relative to a checkout.
    pub fn document(&self, task_id: &str) -> Option<String> {
        let (dir, prefix) = match self {
            DodCriterion::PrdExists => ("docs/prd", "PRD"),
            DodCriterion::AdrExists => ("docs/adr", "ADR"),
            DodCriterion::SpecExists => ("docs/specs", "SPEC"),
            DodCriterion::ReviewDoc => ("docs/reviews", "REVIEW"),
            DodCriterion::UxDoc => ("docs/ux", "UX"),
            _ => return None,
        };
        Some(format!("{}/{}-{}.md", dir, prefix, task_id))
    }
}

impl std::fmt::Display for DodCriterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DodCriterion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        ALL.iter()
            .flat_map(|set| set.iter())
            .find(|c| c.as_str() == wanted)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Unknown DoD criterion '{}'", s))
    }
}

/// Criterion -> satisfied, as supplied by the caller or detected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DodEvidence(pub BTreeMap<DodCriterion, bool>);

impl DodEvidence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, criterion: DodCriterion, satisfied: bool) -> &mut Self {
        self.0.insert(criterion, satisfied);
        self
    }

    /// Parse `name` or `name=true|false` items; a bare name means satisfied.
    pub fn parse_items<S: AsRef<str>>(items: &[S]) -> Result<Self, OrchestrationError> {
        let mut evidence = Self::new();
        for item in items {
            let item = item.as_ref();
            let (name, value) = match item.split_once('=') {
                Some((name, value)) => (name, value.trim()),
                None => (item, "true"),
            };
            let criterion: DodCriterion = name
                .parse()
                .map_err(|e: anyhow::Error| OrchestrationError::InvalidInput(e.to_string()))?;
            let satisfied = match value.to_lowercase().as_str() {
                "true" | "yes" | "1" => true,
                "false" | "no" | "0" => false,
                other => {
                    return Err(OrchestrationError::InvalidInput(format!(
                        "Invalid evidence value '{}' for {}; use true or false",
                        other, criterion
                    )));
                }
            };
            evidence.set(criterion, satisfied);
        }
        Ok(evidence)
    }

    /// Entries from `other` win over entries already present.
    pub fn merge(&mut self, other: &DodEvidence) {
        for (criterion, satisfied) in &other.0 {
            self.0.insert(*criterion, *satisfied);
        }
    }

    /// Evidence that can be read off the filesystem: role documents present
    /// in any of `roots`, and `code_committed` from a clean workspace.
    pub fn detect(role: Role, task_id: &str, roots: &[&Path], workspace_clean: Option<bool>) -> Self {
        let mut evidence = Self::new();
        for criterion in DodCriterion::for_role(role) {
            if let Some(doc) = criterion.document(task_id) {
                let found = roots.iter().any(|root| root.join(&doc).is_file());
                if found {
                    evidence.set(*criterion, true);
                }
            }
            if *criterion == DodCriterion::CodeCommitted
                && let Some(clean) = workspace_clean
            {
                evidence.set(*criterion, clean);
            }
        }
        evidence
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DodEvaluation {
    pub role: Role,
    pub satisfied: Vec<DodCriterion>,
    pub missing: Vec<DodCriterion>,
    pub threshold: f64,
}

impl DodEvaluation {
    pub fn required(&self) -> usize {
        self.satisfied.len() + self.missing.len()
    }

    pub fn ratio(&self) -> f64 {
        if self.required() == 0 {
            1.0
        } else {
            self.satisfied.len() as f64 / self.required() as f64
        }
    }

    pub fn passed(&self) -> bool {
        self.ratio() + f64::EPSILON >= self.threshold
    }

    pub fn to_error(&self) -> OrchestrationError {
        OrchestrationError::DoDIncomplete {
            role: self.role,
            satisfied: self.satisfied.len(),
            required: self.required(),
            threshold: self.threshold,
            missing: self.missing.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Score `evidence` against the checklist of `role`. Evidence naming a
/// criterion from another role's checklist is rejected.
pub fn evaluate(
    role: Role,
    evidence: &DodEvidence,
    threshold: f64,
) -> Result<DodEvaluation, OrchestrationError> {
    let checklist = DodCriterion::for_role(role);
    if let Some(foreign) = evidence.0.keys().find(|c| !checklist.contains(c)) {
        return Err(OrchestrationError::InvalidInput(format!(
            "criterion '{}' is not part of the {} Definition of Done",
            foreign, role
        )));
    }
    let (satisfied, missing): (Vec<DodCriterion>, Vec<DodCriterion>) = checklist
        .iter()
        .partition(|c| evidence.0.get(c).copied().unwrap_or(false));
    Ok(DodEvaluation {
        role,
        satisfied,
        missing,
        threshold,
    })
}
