//! Task-quality and pre-execution checks, and the completion certificate.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::orchestrator::state::ExecutionContext;
use crate::role::Role;
use crate::sync::store::LocalIssue;
use crate::util::atomic_write;

/// Phrases that assume the reader shares context they may not have.
pub const IMPLICIT_KNOWLEDGE_PHRASES: &[&str] = &[
    "as discussed",
    "like before",
    "you know",
    "as usual",
    "obviously",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl CheckResult {
    fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            remediation: None,
        }
    }

    fn check(name: &str, passed: bool, remediation: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed,
            remediation: (!passed).then(|| remediation.into()),
        }
    }

    /// One-line form recorded as a validation failure.
    pub fn failure_line(&self) -> String {
        match &self.remediation {
            Some(fix) => format!("{}: {}", self.name, fix),
            None => self.name.clone(),
        }
    }
}

/// The "stranger test": could someone with no shared history execute this task?
pub fn task_quality(issue: &LocalIssue) -> Vec<CheckResult> {
    let body = issue.body.to_lowercase();
    let found: Vec<&str> = IMPLICIT_KNOWLEDGE_PHRASES
        .iter()
        .copied()
        .filter(|phrase| body.contains(phrase))
        .collect();

    vec![
        CheckResult::check(
            "Title exists",
            !issue.title.trim().is_empty(),
            "Give the issue a descriptive title",
        ),
        CheckResult::check(
            "Description exists",
            issue.body.trim().len() >= 20,
            "Describe the task in at least a couple of sentences",
        ),
        CheckResult::check(
            "Acceptance criteria defined",
            !issue.acceptance_criteria.is_empty() || body.contains("acceptance criteria"),
            "Add acceptance criteria (--criterion) so completion can be verified",
        ),
        if found.is_empty() {
            CheckResult::pass("No implicit knowledge")
        } else {
            CheckResult::check(
                "No implicit knowledge",
                false,
                format!("Spell out what is meant by: {}", found.join(", ")),
            )
        },
    ]
}

/// Facts gathered by the caller before running [`pre_execution`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PreExecutionFacts {
    pub context_artifact_exists: bool,
    pub branch_exists: bool,
}

/// Is everything in place for the agent to start work?
pub fn pre_execution(
    ctx: Option<&ExecutionContext>,
    task_id: &str,
    facts: PreExecutionFacts,
) -> Vec<CheckResult> {
    let registered = ctx.is_some_and(|c| !c.state.is_terminal());
    let workspace = ctx
        .and_then(|c| c.workspace_path.as_deref())
        .is_some_and(Path::is_dir);

    vec![
        CheckResult::check(
            "Context file exists",
            facts.context_artifact_exists,
            format!("Run: weave context {}", task_id),
        ),
        CheckResult::check(
            "Context registered",
            registered,
            format!("Run: weave spawn {}", task_id),
        ),
        CheckResult::check(
            "Worktree accessible",
            workspace,
            format!("Run: weave recover {}", task_id),
        ),
        CheckResult::check(
            "Branch exists",
            facts.branch_exists,
            format!("Run: weave recover {}", task_id),
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateItem {
    pub check: String,
    pub passed: bool,
}

/// Written to `.weave/certificates/cert-<task>.json` when a context completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: String,
    pub task_id: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub checklist: Vec<CertificateItem>,
    pub all_passed: bool,
}

impl Certificate {
    pub fn for_context(ctx: &ExecutionContext) -> Self {
        let timestamp = Utc::now();
        let checklist: Vec<CertificateItem> = ctx
            .handoff_checklist
            .iter()
            .map(|(check, passed)| CertificateItem {
                check: check.clone(),
                passed: *passed,
            })
            .chain(std::iter::once(CertificateItem {
                check: "no_outstanding_validation_failures".to_string(),
                passed: ctx.validation_failures.is_empty(),
            }))
            .collect();
        let all_passed = checklist.iter().all(|item| item.passed);
        Self {
            id: format!("CERT-{}-{}", ctx.task_id, timestamp.format("%Y%m%d%H%M")),
            task_id: ctx.task_id.clone(),
            role: ctx.role,
            timestamp,
            branch: ctx.branch.clone(),
            checklist,
            all_passed,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize certificate")?;
        atomic_write(path, &json)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::store::{IssueState, IssueType};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn issue(title: &str, body: &str, criteria: &[&str]) -> LocalIssue {
        let now = Utc::now();
        LocalIssue {
            id: 1,
            title: title.to_string(),
            body: body.to_string(),
            labels: vec![],
            issue_type: IssueType::Story,
            role: None,
            state: IssueState::Open,
            acceptance_criteria: criteria.iter().map(|c| c.to_string()).collect(),
            dependencies: vec![],
            deliverables: vec![],
            created_at: now,
            updated_at: now,
            remote_id: None,
            synced: false,
            synced_at: None,
            remote_status: None,
        }
    }

    #[test]
    fn test_well_formed_task_passes() {
        let checks = task_quality(&issue(
            "Add password reset",
            "Users can request a reset link by email from the login page.",
            &["Link expires after 1 hour"],
        ));
        assert!(checks.iter().all(|c| c.passed), "{checks:?}");
    }

    #[test]
    fn test_implicit_knowledge_is_flagged() {
        let checks = task_quality(&issue(
            "Fix the thing",
            "Obviously, do it like before, as discussed in standup.",
            &["done"],
        ));
        let implicit = checks
            .iter()
            .find(|c| c.name == "No implicit knowledge")
            .unwrap();
        assert!(!implicit.passed);
        let fix = implicit.remediation.as_deref().unwrap();
        assert!(fix.contains("as discussed"));
        assert!(fix.contains("like before"));
        assert!(fix.contains("obviously"));
    }

    #[test]
    fn test_missing_description_and_criteria() {
        let checks = task_quality(&issue("Title", "short", &[]));
        let failed: Vec<&str> = checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(failed, vec!["Description exists", "Acceptance criteria defined"]);
    }

    #[test]
    fn test_pre_execution_without_context() {
        let checks = pre_execution(None, "42", PreExecutionFacts::default());
        assert!(checks.iter().all(|c| !c.passed));
        assert_eq!(
            checks[1].failure_line(),
            "Context registered: Run: weave spawn 42"
        );
    }

    #[test]
    fn test_pre_execution_with_workspace() {
        let dir = tempdir().unwrap();
        let mut ctx = ExecutionContext::new("42", Role::Engineer);
        ctx.workspace_path = Some(dir.path().to_path_buf());
        ctx.branch = Some("task-42".into());
        let checks = pre_execution(
            Some(&ctx),
            "42",
            PreExecutionFacts {
                context_artifact_exists: true,
                branch_exists: true,
            },
        );
        assert!(checks.iter().all(|c| c.passed));
    }

    #[test]
    fn test_certificate_roundtrip() {
        let dir = tempdir().unwrap();
        let mut ctx = ExecutionContext::new("42", Role::Engineer);
        ctx.handoff_checklist = BTreeMap::from([
            ("code_committed".to_string(), true),
            ("security_scan".to_string(), false),
        ]);
        let cert = Certificate::for_context(&ctx);
        assert!(cert.id.starts_with("CERT-42-"));
        assert_eq!(cert.checklist.len(), 3);
        assert!(!cert.all_passed);

        let path = dir.path().join("cert-42.json");
        cert.write(&path).unwrap();
        assert_eq!(Certificate::load(&path).unwrap(), cert);
    }
}
