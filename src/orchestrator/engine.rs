//! The `Orchestrator` facade.
//!
//! Every CLI command goes through here. Registry and issue store changes are
//! audited by commit hooks; context artifacts and workspace releases are
//! audited explicitly, before the side effect.

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::audit_hook;
use super::isolation::{IsolationManager, RecoveryOutcome};
use super::state::{ExecutionContext, LifecycleState, Registry};
use crate::audit::{AuditAction, AuditLog};
use crate::config::Config;
use crate::context::{ArtifactMeta, ContextArtifact, ContextAssembler, TaskSpec};
use crate::errors::{OrchestrationError, TrackerError};
use crate::gates::checks::{self, Certificate, CheckResult, PreExecutionFacts};
use crate::gates::{DodEvaluation, DodEvidence, ValidationGate};
use crate::health::{HealthMonitor, refresh_activity};
use crate::retry::RetryPolicy;
use crate::role::Role;
use crate::sync::{SyncEngine, issue_audit_hook};
use crate::sync::store::{IssueFilter, LocalIssue, LocalIssueStore, NewLocalIssue};
use crate::tracker::{self, Tracker};
use crate::vcs::{BranchNote, GitVcs, Vcs};

/// Actor recorded in the audit log for engine actions.
pub const ACTOR: &str = "weave";

/// Input for [`Orchestrator::spawn`].
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub task_id: String,
    /// Overrides the role resolved from the issue.
    pub role: Option<Role>,
    /// Defaults to `task-<task id>`.
    pub branch: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SpawnOutcome {
    pub context: ExecutionContext,
    pub artifact: ContextArtifact,
}

#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub context: ExecutionContext,
    pub certificate_path: PathBuf,
    /// False when the workspace could not be removed; `recover` or a forced
    /// release cleans it up later.
    pub released: bool,
}

/// One row of `weave status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub context: ExecutionContext,
    pub note: Option<BranchNote>,
    pub idle_hours: f64,
    pub threshold_hours: u64,
    pub workspace_present: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub task_id: String,
    /// Empty when the task has no local issue.
    pub quality: Vec<CheckResult>,
    pub pre_execution: Vec<CheckResult>,
    /// Whether the outcome was stored on a live context.
    pub recorded: bool,
}

impl ValidationReport {
    pub fn checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.quality.iter().chain(self.pre_execution.iter())
    }

    pub fn failures(&self) -> Vec<String> {
        self.checks()
            .filter(|c| !c.passed)
            .map(CheckResult::failure_line)
            .collect()
    }

    pub fn passed(&self) -> bool {
        self.checks().all(|c| c.passed)
    }
}

pub struct Orchestrator {
    config: Config,
    registry: Arc<Registry>,
    audit: Arc<AuditLog>,
    isolation: IsolationManager,
    issues: Arc<LocalIssueStore>,
    assembler: ContextAssembler,
    gate: ValidationGate,
    vcs: Arc<dyn Vcs>,
    tracker: Option<Arc<dyn Tracker>>,
}

impl Orchestrator {
    /// Open the project described by `config` against its git repository and
    /// configured tracker. A half-configured tracker is logged and ignored.
    pub fn open(config: Config) -> Result<Self, OrchestrationError> {
        let vcs = GitVcs::discover(
            &config.project_dir,
            Duration::from_secs(config.toml.workspace.git_timeout_secs),
            RetryPolicy::from_config(&config.toml.retry),
        )?;
        let tracker = match tracker::from_config(&config) {
            Ok(tracker) => tracker,
            Err(TrackerError::NotConfigured(reason)) => {
                warn!(reason = %reason, "Tracker not configured; working offline");
                None
            }
            Err(e) => return Err(e.into()),
        };
        Self::with_parts(config, Arc::new(vcs), tracker)
    }

    pub fn with_parts(
        config: Config,
        vcs: Arc<dyn Vcs>,
        tracker: Option<Arc<dyn Tracker>>,
    ) -> Result<Self, OrchestrationError> {
        let audit = Arc::new(AuditLog::new(&config.audit_file, &config.audit_lock));
        let registry = Arc::new(
            Registry::open(&config.registry_file, &config.registry_lock)?
                .with_commit_hook(audit_hook(audit.clone(), ACTOR.to_string())),
        );
        let isolation =
            IsolationManager::new(vcs.clone(), registry.clone(), config.worktree_base.clone());
        let issues = Arc::new(
            LocalIssueStore::new(&config.issues_file, &config.issues_lock)
                .with_commit_hook(issue_audit_hook(audit.clone())),
        );
        let assembler = ContextAssembler::from_config(&config)?;
        let gate = ValidationGate::new(config.toml.gates.clone());
        Ok(Self {
            config,
            registry,
            audit,
            isolation,
            issues,
            assembler,
            gate,
            vcs,
            tracker,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn issues(&self) -> &Arc<LocalIssueStore> {
        &self.issues
    }

    fn require(&self, task_id: &str) -> Result<ExecutionContext, OrchestrationError> {
        self.registry
            .get(task_id)
            .ok_or_else(|| OrchestrationError::NotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Task description from the local issue store, else from the registry
    /// record, else a bare spec carrying only the id.
    fn task_spec(&self, task_id: &str) -> Result<TaskSpec, OrchestrationError> {
        if let Some(issue) = self.issues.find(task_id)? {
            return Ok(TaskSpec::from(&issue));
        }
        let mut spec = TaskSpec {
            task_id: task_id.to_string(),
            title: task_id.to_string(),
            ..TaskSpec::default()
        };
        if let Some(ctx) = self.registry.get(task_id) {
            spec.role = Some(ctx.role);
            if let Some(title) = ctx.title {
                spec.title = title;
            }
            spec.issue_type = ctx.issue_type.as_deref().and_then(|t| t.parse().ok());
        }
        Ok(spec)
    }

    fn assemble(&self, spec: &TaskSpec) -> Result<ContextArtifact, OrchestrationError> {
        let artifact = self.assembler.assemble(spec)?;
        let mut result = format!("{} tokens", artifact.tokens());
        if artifact.oversized() {
            result.push_str(", above soft ceiling");
        }
        if !artifact.meta.missing_sections.is_empty() {
            result.push_str(&format!(
                ", missing {}",
                artifact.meta.missing_sections.join(", ")
            ));
        }
        self.audit.append(
            ACTOR,
            AuditAction::ContextAssembled,
            Some(&spec.task_id),
            &result,
        )?;
        Ok(artifact)
    }

    /// Keep the branch note in step with the record. Best effort.
    async fn update_note(&self, ctx: &ExecutionContext) {
        let Some(branch) = ctx.branch.as_deref() else {
            return;
        };
        let note = BranchNote {
            task_id: ctx.task_id.clone(),
            role: ctx.role,
            status: ctx.state,
            created_at: ctx.created_at,
        };
        if let Err(e) = self.vcs.write_note(branch, &note).await {
            debug!(task_id = %ctx.task_id, branch, error = %e, "could not update branch note");
        }
    }

    /// Assemble context, register, allocate a workspace and activate.
    ///
    /// Nothing is registered when the context is too large, the branch is
    /// taken (by a record or by a git worktree) or the workspace directory
    /// already exists. A cancelled allocation leaves the record in `Created`
    /// for `recover`; any other allocation failure fails the context.
    pub async fn spawn(
        &self,
        request: SpawnRequest,
        cancel: &CancellationToken,
    ) -> Result<SpawnOutcome, OrchestrationError> {
        let task_id = request.task_id.trim().to_string();
        if task_id.is_empty() {
            return Err(OrchestrationError::InvalidInput(
                "task id must not be empty".to_string(),
            ));
        }
        let branch = request
            .branch
            .clone()
            .unwrap_or_else(|| format!("task-{}", task_id));

        let snapshot = self.registry.snapshot();
        if let Some(existing) = snapshot.active(&task_id) {
            return Err(OrchestrationError::DuplicateActive {
                task_id,
                state: existing.state,
            });
        }
        self.isolation.preflight(&task_id, &branch).await?;

        let mut spec = self.task_spec(&task_id)?;
        if let Some(role) = request.role {
            spec.role = Some(role);
        }
        if let Some(title) = &request.title {
            spec.title = title.clone();
        }
        let role = spec.resolve_role();
        let artifact = self.assemble(&spec)?;

        self.registry.register(
            &task_id,
            role,
            Some(spec.title.clone()),
            spec.issue_type.map(|t| t.as_str().to_string()),
        )?;

        let base = self.config.base_branch();
        if let Err(err) = self.isolation.allocate(&task_id, &branch, &base, cancel).await {
            if !matches!(err, OrchestrationError::Cancelled) {
                if let Err(fail) = self.registry.transition(
                    &task_id,
                    LifecycleState::Failed,
                    Some(format!("allocation failed: {}", err)),
                ) {
                    warn!(task_id = %task_id, error = %fail, "could not mark context failed");
                }
            }
            return Err(err);
        }

        let ctx = self.require(&task_id)?;
        self.gate.check_activation(&ctx)?;
        let ctx = self.registry.transition(
            &task_id,
            LifecycleState::Active,
            Some("workspace allocated".to_string()),
        )?;
        self.update_note(&ctx).await;
        info!(task_id = %task_id, role = %role, branch = ctx.branch.as_deref().unwrap_or(""), "context spawned");
        Ok(SpawnOutcome {
            context: ctx,
            artifact,
        })
    }

    /// `Active -> AwaitingHandoff`. Evidence found on disk is merged with
    /// `evidence`; explicit items win.
    pub async fn handoff(
        &self,
        task_id: &str,
        evidence: &DodEvidence,
    ) -> Result<(ExecutionContext, DodEvaluation), OrchestrationError> {
        let ctx = self.require(task_id)?;
        let workspace = ctx.workspace_path.clone().filter(|p| p.is_dir());
        let workspace_clean = match &workspace {
            Some(path) => Some(!self.vcs.is_dirty(path).await?),
            None => None,
        };
        let mut roots: Vec<&Path> = Vec::new();
        if let Some(path) = &workspace {
            roots.push(path);
        }
        roots.push(&self.config.project_dir);

        let mut merged = DodEvidence::detect(ctx.role, task_id, &roots, workspace_clean);
        merged.merge(evidence);

        let evaluation = self.gate.check_handoff(&ctx, &merged)?;
        let ctx = self
            .registry
            .hand_off(task_id, evaluation.checklist(), evaluation.summary())?;
        self.update_note(&ctx).await;
        info!(task_id, summary = %evaluation.summary(), "handed off");
        Ok((ctx, evaluation))
    }

    /// `AwaitingHandoff -> Completed`, then release the workspace and write
    /// the completion certificate. Without `force` a workspace holding
    /// uncommitted or unpushed work blocks completion.
    pub async fn complete(
        &self,
        task_id: &str,
        force: bool,
    ) -> Result<CompletionOutcome, OrchestrationError> {
        let ctx = self.require(task_id)?;
        self.gate.check_completion(&ctx)?;
        if !force {
            self.isolation.ensure_releasable(&ctx).await?;
        }

        let ctx = self.registry.transition(task_id, LifecycleState::Completed, None)?;
        self.update_note(&ctx).await;

        let certificate_path = self.config.certificate_path(task_id);
        Certificate::for_context(&ctx).write(&certificate_path)?;

        let released = self.release_after_terminal(&ctx, force).await?;
        Ok(CompletionOutcome {
            context: ctx,
            certificate_path,
            released,
        })
    }

    /// Audit the release, then remove the workspace.
    async fn release_workspace(&self, ctx: &ExecutionContext, force: bool) -> Result<(), OrchestrationError> {
        let Some(path) = ctx.workspace_path.as_deref() else {
            return Ok(());
        };
        if !force {
            self.isolation.ensure_releasable(ctx).await?;
        }
        self.audit.append(
            ACTOR,
            AuditAction::Released,
            Some(&ctx.task_id),
            &path.display().to_string(),
        )?;
        if let Err(e) = self.isolation.release(&ctx.task_id, force).await {
            if let Err(audit) = self.audit.append(
                ACTOR,
                AuditAction::Released,
                Some(&ctx.task_id),
                &format!("release of {} failed: {}", path.display(), e),
            ) {
                warn!(task_id = %ctx.task_id, error = %audit, "could not audit failed release");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Release after the record went terminal. A failure other than the
    /// audit log is logged and reported as `false`; `recover` removes the
    /// leftover later.
    async fn release_after_terminal(
        &self,
        ctx: &ExecutionContext,
        force: bool,
    ) -> Result<bool, OrchestrationError> {
        match self.release_workspace(ctx, force).await {
            Ok(()) => Ok(true),
            Err(e @ OrchestrationError::AuditUnavailable { .. }) => Err(e),
            Err(e) => {
                warn!(task_id = %ctx.task_id, error = %e, "workspace not released");
                Ok(false)
            }
        }
    }

    /// Any non-terminal state -> `Failed`, then release the workspace.
    /// Without `force` a workspace holding uncommitted or unpushed work
    /// refuses the failure and nothing changes.
    pub async fn fail(
        &self,
        task_id: &str,
        reason: &str,
        force: bool,
    ) -> Result<ExecutionContext, OrchestrationError> {
        let live = self.registry.snapshot().active(task_id).cloned();
        if let Some(ctx) = live.filter(|_| !force) {
            self.isolation.ensure_releasable(&ctx).await?;
        }
        let ctx = self
            .registry
            .retire(task_id, LifecycleState::Failed, Some(reason.to_string()))?;
        self.update_note(&ctx).await;
        self.release_after_terminal(&ctx, true).await?;
        Ok(ctx)
    }

    /// Repair a live context, or remove the workspace a terminal record left
    /// behind when its release failed.
    pub async fn recover(&self, task_id: &str) -> Result<RecoveryOutcome, OrchestrationError> {
        self.registry.reload()?;
        let snapshot = self.registry.snapshot();
        if snapshot.active(task_id).is_none()
            && let Some(ctx) = self.registry.get(task_id)
        {
            return self.recover_terminal(&ctx).await;
        }
        let outcome = self.isolation.recover(task_id).await?;
        if let RecoveryOutcome::Repaired(_) = &outcome
            && let Some(ctx) = self.registry.get(task_id)
        {
            self.update_note(&ctx).await;
        }
        Ok(outcome)
    }

    async fn recover_terminal(&self, ctx: &ExecutionContext) -> Result<RecoveryOutcome, OrchestrationError> {
        let Some(path) = ctx.workspace_path.as_deref().filter(|p| p.is_dir()) else {
            return Ok(RecoveryOutcome::Healthy);
        };
        self.release_workspace(ctx, false).await?;
        info!(task_id = %ctx.task_id, state = %ctx.state, "leftover workspace released");
        Ok(RecoveryOutcome::Repaired(format!(
            "released leftover workspace {} of {} task",
            path.display(),
            ctx.state
        )))
    }

    /// Live status of one task, or of every non-terminal context. Activity
    /// figures are refreshed from the VCS first.
    pub async fn status(&self, task_id: Option<&str>) -> Result<Vec<StatusEntry>, OrchestrationError> {
        let contexts = match task_id {
            Some(task_id) => vec![self.require(task_id)?],
            None => self.registry.list_active(),
        };
        let now = Utc::now();
        let mut entries = Vec::with_capacity(contexts.len());
        for ctx in contexts {
            let ctx = if ctx.state.is_terminal() {
                ctx
            } else {
                refresh_activity(&self.registry, self.vcs.as_ref(), &ctx).await?.0
            };
            let note = match ctx.branch.as_deref() {
                Some(branch) => self.vcs.read_note(branch).await.ok().flatten(),
                None => None,
            };
            let idle_hours = (now - ctx.last_activity).num_seconds().max(0) as f64 / 3600.0;
            entries.push(StatusEntry {
                threshold_hours: self.config.toml.health.threshold_for(ctx.issue_type.as_deref()),
                workspace_present: ctx.workspace_path.as_deref().is_some_and(Path::is_dir),
                note,
                idle_hours,
                context: ctx,
            });
        }
        Ok(entries)
    }

    pub fn list(&self, all: bool) -> Vec<ExecutionContext> {
        if all {
            self.registry.list_all()
        } else {
            self.registry.list_active()
        }
    }

    /// Run the task-quality and pre-execution checks. On a live context the
    /// failures replace its outstanding validation failures.
    pub async fn validate(&self, task_id: &str) -> Result<ValidationReport, OrchestrationError> {
        let quality = match self.issues.find(task_id)? {
            Some(issue) => checks::task_quality(&issue),
            None => Vec::new(),
        };
        let ctx = self.registry.get(task_id);
        let branch_exists = match ctx.as_ref().and_then(|c| c.branch.as_deref()) {
            Some(branch) => self.vcs.branch_exists(branch).await?,
            None => false,
        };
        let facts = PreExecutionFacts {
            context_artifact_exists: ArtifactMeta::read(&self.assembler.artifact_path(task_id)).is_ok(),
            branch_exists,
        };
        let pre_execution = checks::pre_execution(ctx.as_ref(), task_id, facts);

        let mut report = ValidationReport {
            task_id: task_id.to_string(),
            quality,
            pre_execution,
            recorded: false,
        };
        if ctx.is_some_and(|c| !c.state.is_terminal()) {
            self.registry.record_validation(task_id, report.failures())?;
            report.recorded = true;
        }
        Ok(report)
    }

    /// Regenerate the context artifact of a task.
    pub fn context(&self, task_id: &str) -> Result<ContextArtifact, OrchestrationError> {
        let spec = self.task_spec(task_id)?;
        self.assemble(&spec)
    }

    pub fn create_issue(&self, new: NewLocalIssue) -> Result<LocalIssue, OrchestrationError> {
        self.issues.create(new)
    }

    pub fn close_issue(&self, id: u64) -> Result<LocalIssue, OrchestrationError> {
        self.issues.close(id)
    }

    pub fn list_issues(&self, filter: &IssueFilter) -> Result<Vec<LocalIssue>, OrchestrationError> {
        Ok(self.issues.list(filter)?)
    }

    pub fn show_issue(&self, id: u64) -> Result<LocalIssue, OrchestrationError> {
        self.issues
            .get(id)?
            .ok_or_else(|| OrchestrationError::NotFound {
                task_id: id.to_string(),
            })
    }

    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            self.registry.clone(),
            self.vcs.clone(),
            self.audit.clone(),
            self.config.toml.health.clone(),
        )
    }

    pub fn sync_engine(&self) -> SyncEngine {
        SyncEngine::new(self.issues.clone(), self.tracker.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::sync::store::IssueType;
    use crate::tracker::mock::MockTracker;
    use crate::vcs::mock::MockVcs;
    use crate::weave_config::WeaveToml;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        vcs: Arc<MockVcs>,
        orch: Orchestrator,
    }

    fn fixture_with(toml: WeaveToml, tracker: Option<Arc<dyn Tracker>>) -> Fixture {
        let dir = tempdir().unwrap();
        let agents = dir.path().join(".github/agents");
        std::fs::create_dir_all(&agents).unwrap();
        for role in Role::ALL {
            std::fs::write(
                agents.join(role.instruction_file()),
                format!("# {} instructions\n\nDo the {} work.\n", role, role),
            )
            .unwrap();
        }
        let config = Config::from_parts(dir.path().to_path_buf(), toml, false);
        config.ensure_directories().unwrap();
        let vcs = Arc::new(MockVcs::new());
        let orch = Orchestrator::with_parts(config, vcs.clone(), tracker).unwrap();
        Fixture { dir, vcs, orch }
    }

    fn fixture() -> Fixture {
        fixture_with(WeaveToml::default(), None)
    }

    fn request(task_id: &str, role: Role) -> SpawnRequest {
        SpawnRequest {
            task_id: task_id.to_string(),
            role: Some(role),
            ..SpawnRequest::default()
        }
    }

    fn actions(fx: &Fixture, task_id: &str) -> Vec<AuditAction> {
        fx.orch
            .audit()
            .query(Some(task_id))
            .unwrap()
            .map(|e| e.unwrap().action)
            .collect()
    }

    #[tokio::test]
    async fn test_spawn_activates_with_workspace_and_context() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        let outcome = fx.orch.spawn(request("42", Role::Engineer), &cancel).await.unwrap();

        assert_eq!(outcome.context.state, LifecycleState::Active);
        assert_eq!(outcome.context.branch.as_deref(), Some("task-42"));
        assert!(outcome.context.workspace_path.as_ref().unwrap().is_dir());
        assert!(outcome.artifact.path.is_file());
        assert_eq!(fx.vcs.note("task-42").unwrap().status, LifecycleState::Active);
        assert_eq!(
            actions(&fx, "42"),
            vec![
                AuditAction::ContextAssembled,
                AuditAction::Registered,
                AuditAction::Allocated,
                AuditAction::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_second_task_on_same_branch_is_rejected() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        fx.orch.spawn(request("42", Role::Engineer), &cancel).await.unwrap();

        let err = fx
            .orch
            .spawn(
                SpawnRequest {
                    branch: Some("task-42".to_string()),
                    ..request("43", Role::Engineer)
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            OrchestrationError::BranchInUse { holder: Some(h), .. } if h == "42"
        ));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(fx.orch.registry().get("43").is_none());
    }

    #[tokio::test]
    async fn test_spawn_twice_is_duplicate() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        fx.orch.spawn(request("42", Role::Engineer), &cancel).await.unwrap();
        let err = fx
            .orch
            .spawn(request("42", Role::Engineer), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::DuplicateActive { .. }));
    }

    #[tokio::test]
    async fn test_failed_allocation_fails_the_context() {
        let fx = fixture();
        fx.vcs.fail_creates_with("fatal: invalid reference: nope");
        let err = fx
            .orch
            .spawn(request("42", Role::Engineer), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::AllocationFailed { .. }));
        assert_eq!(fx.orch.registry().get("42").unwrap().state, LifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_spawn_leaves_created_record() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fx
            .orch
            .spawn(request("42", Role::Engineer), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Cancelled));
        assert_eq!(fx.orch.registry().get("42").unwrap().state, LifecycleState::Created);
    }

    #[tokio::test]
    async fn test_oversized_context_registers_nothing() {
        let mut toml = WeaveToml::default();
        toml.context.soft_limit_tokens = 5;
        toml.context.hard_limit_tokens = 10;
        let fx = fixture_with(toml, None);
        let err = fx
            .orch
            .spawn(request("42", Role::Engineer), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::ContextTooLarge { .. }));
        assert!(fx.orch.registry().get("42").is_none());
        assert!(!fx.orch.config().context_path("42").exists());
    }

    #[tokio::test]
    async fn test_handoff_with_one_of_five_stays_active() {
        let fx = fixture();
        fx.orch
            .spawn(request("7", Role::Pm), &CancellationToken::new())
            .await
            .unwrap();
        let evidence = DodEvidence::parse_items(&["prd_exists"]).unwrap();
        let err = fx.orch.handoff("7", &evidence).await.unwrap_err();
        match err {
            OrchestrationError::DoDIncomplete {
                satisfied, required, ..
            } => {
                assert_eq!(satisfied, 1);
                assert_eq!(required, 5);
            }
            other => panic!("expected DoDIncomplete, got {other}"),
        }
        assert_eq!(fx.orch.registry().get("7").unwrap().state, LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_handoff_detects_documents_on_disk() {
        let fx = fixture();
        fx.orch
            .spawn(request("8", Role::Architect), &CancellationToken::new())
            .await
            .unwrap();
        let docs = fx.dir.path().join("docs");
        std::fs::create_dir_all(docs.join("adr")).unwrap();
        std::fs::create_dir_all(docs.join("specs")).unwrap();
        std::fs::write(docs.join("adr/ADR-8.md"), "# ADR").unwrap();
        std::fs::write(docs.join("specs/SPEC-8.md"), "# Spec").unwrap();

        let evidence = DodEvidence::parse_items(&[
            "options_documented",
            "decision_rationale",
            "no_code_examples",
        ])
        .unwrap();
        let (ctx, evaluation) = fx.orch.handoff("8", &evidence).await.unwrap();
        assert_eq!(ctx.state, LifecycleState::AwaitingHandoff);
        assert!(evaluation.passed());
        assert_eq!(ctx.handoff_checklist.get("adr_exists"), Some(&true));
    }

    async fn awaiting_engineer(fx: &Fixture, task_id: &str) -> ExecutionContext {
        fx.orch
            .spawn(request(task_id, Role::Engineer), &CancellationToken::new())
            .await
            .unwrap();
        let evidence = DodEvidence::parse_items(&[
            "tests_written",
            "tests_passing",
            "docs_updated",
            "no_lint_errors",
            "security_scan",
        ])
        .unwrap();
        fx.orch.handoff(task_id, &evidence).await.unwrap().0
    }

    #[tokio::test]
    async fn test_complete_writes_certificate_and_releases() {
        let fx = fixture();
        let ctx = awaiting_engineer(&fx, "9").await;
        assert_eq!(ctx.handoff_checklist.get("code_committed"), Some(&true));
        let workspace = ctx.workspace_path.clone().unwrap();

        let outcome = fx.orch.complete("9", false).await.unwrap();
        assert_eq!(outcome.context.state, LifecycleState::Completed);
        assert!(outcome.released);
        assert!(!workspace.exists());

        let cert = Certificate::load(&outcome.certificate_path).unwrap();
        assert!(cert.all_passed);
        assert_eq!(cert.task_id, "9");
        assert!(actions(&fx, "9").contains(&AuditAction::Released));
        assert_eq!(fx.orch.audit().verify().unwrap(), None);
    }

    #[tokio::test]
    async fn test_complete_refuses_dirty_workspace_without_force() {
        let fx = fixture();
        let ctx = awaiting_engineer(&fx, "9").await;
        let workspace = ctx.workspace_path.clone().unwrap();
        fx.vcs.set_dirty(&workspace, true);

        let err = fx.orch.complete("9", false).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::UncommittedChanges { .. }));
        assert_eq!(
            fx.orch.registry().get("9").unwrap().state,
            LifecycleState::AwaitingHandoff
        );

        let outcome = fx.orch.complete("9", true).await.unwrap();
        assert!(outcome.released);
    }

    #[tokio::test]
    async fn test_outstanding_validation_failures_block_completion() {
        let fx = fixture();
        awaiting_engineer(&fx, "9").await;
        fx.orch
            .registry()
            .record_validation("9", vec!["Branch exists: missing".into()])
            .unwrap();
        let err = fx.orch.complete("9", false).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::OutstandingValidationFailures { count: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_terminal_context_rejects_mutation() {
        let fx = fixture();
        fx.orch
            .spawn(request("5", Role::Engineer), &CancellationToken::new())
            .await
            .unwrap();
        let ctx = fx.orch.fail("5", "abandoned", true).await.unwrap();
        assert_eq!(ctx.state, LifecycleState::Failed);
        assert!(!ctx.workspace_path.unwrap().exists());

        let err = fx.orch.handoff("5", &DodEvidence::new()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::TerminalState { .. }));
    }

    #[tokio::test]
    async fn test_fail_releases_workspace_and_task_can_be_respawned() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        let first = fx.orch.spawn(request("42", Role::Engineer), &cancel).await.unwrap();
        let workspace = first.context.workspace_path.clone().unwrap();

        let ctx = fx.orch.fail("42", "wrong approach", false).await.unwrap();
        assert_eq!(ctx.state, LifecycleState::Failed);
        assert!(!workspace.exists());
        assert!(actions(&fx, "42").ends_with(&[AuditAction::Failed, AuditAction::Released]));

        let again = fx.orch.spawn(request("42", Role::Engineer), &cancel).await.unwrap();
        assert_eq!(again.context.state, LifecycleState::Active);
        assert_eq!(again.context.branch.as_deref(), Some("task-42"));
        assert!(workspace.is_dir());
        assert_eq!(fx.vcs.create_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_refuses_dirty_workspace_without_force() {
        let fx = fixture();
        let outcome = fx
            .orch
            .spawn(request("42", Role::Engineer), &CancellationToken::new())
            .await
            .unwrap();
        let workspace = outcome.context.workspace_path.clone().unwrap();
        fx.vcs.set_dirty(&workspace, true);

        let err = fx.orch.fail("42", "obsolete", false).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::UncommittedChanges { .. }));
        assert_eq!(fx.orch.registry().get("42").unwrap().state, LifecycleState::Active);
        assert!(workspace.is_dir());

        fx.orch.fail("42", "obsolete", true).await.unwrap();
        assert!(!workspace.exists());
    }

    #[tokio::test]
    async fn test_recover_releases_leftover_workspace_of_failed_task() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        let outcome = fx.orch.spawn(request("42", Role::Engineer), &cancel).await.unwrap();
        let workspace = outcome.context.workspace_path.clone().unwrap();

        fx.vcs.fail_removes_with(Some("device or resource busy"));
        let ctx = fx.orch.fail("42", "abandoned", false).await.unwrap();
        assert_eq!(ctx.state, LifecycleState::Failed);
        assert!(workspace.is_dir());

        // The leftover worktree still holds the branch: nothing is registered.
        let err = fx.orch.spawn(request("42", Role::Engineer), &cancel).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::BranchInUse { holder: None, .. }));
        assert_eq!(fx.orch.registry().get("42").unwrap().state, LifecycleState::Failed);
        assert_eq!(fx.orch.registry().list_all().len(), 1);

        fx.vcs.fail_removes_with(None);
        let recovered = fx.orch.recover("42").await.unwrap();
        assert!(matches!(recovered, RecoveryOutcome::Repaired(_)));
        assert!(!workspace.exists());
        assert_eq!(fx.orch.recover("42").await.unwrap(), RecoveryOutcome::Healthy);

        let again = fx.orch.spawn(request("42", Role::Engineer), &cancel).await.unwrap();
        assert_eq!(again.context.state, LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_release_is_audited_before_the_workspace_is_removed() {
        let fx = fixture();
        let outcome = fx
            .orch
            .spawn(request("42", Role::Engineer), &CancellationToken::new())
            .await
            .unwrap();
        let workspace = outcome.context.workspace_path.clone().unwrap();
        fx.vcs.fail_removes_with(Some("device or resource busy"));
        fx.orch.fail("42", "abandoned", false).await.unwrap();
        fx.vcs.fail_removes_with(None);
        let removes = fx.vcs.remove_calls.load(std::sync::atomic::Ordering::SeqCst);

        let audit_file = fx.orch.config().audit_file.clone();
        std::fs::remove_file(&audit_file).unwrap();
        std::fs::create_dir(&audit_file).unwrap();

        let err = fx.orch.recover("42").await.unwrap_err();
        assert!(matches!(err, OrchestrationError::AuditUnavailable { .. }));
        assert!(workspace.is_dir());
        assert_eq!(fx.vcs.remove_calls.load(std::sync::atomic::Ordering::SeqCst), removes);
    }

    #[tokio::test]
    async fn test_existing_workspace_directory_registers_nothing() {
        let fx = fixture();
        let stray = fx.orch.config().worktree_base.join("43");
        std::fs::create_dir_all(&stray).unwrap();

        let err = fx
            .orch
            .spawn(request("43", Role::Engineer), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidInput(_)));
        assert!(fx.orch.registry().get("43").is_none());
        assert!(actions(&fx, "43").is_empty());
    }

    #[tokio::test]
    async fn test_validate_records_and_clears_failures() {
        let fx = fixture();
        let issue = fx
            .orch
            .create_issue(NewLocalIssue {
                title: "Add login".into(),
                body: "Users sign in with email and password via the form.".into(),
                issue_type: IssueType::Story,
                acceptance_criteria: vec!["Login works".into()],
                ..NewLocalIssue::default()
            })
            .unwrap();
        let task_id = issue.task_id();
        fx.orch
            .spawn(request(&task_id, Role::Engineer), &CancellationToken::new())
            .await
            .unwrap();

        let report = fx.orch.validate(&task_id).await.unwrap();
        assert!(report.passed(), "{:?}", report.failures());
        assert!(report.recorded);

        std::fs::remove_file(fx.orch.config().context_path(&task_id)).unwrap();
        let report = fx.orch.validate(&task_id).await.unwrap();
        assert!(!report.passed());
        let ctx = fx.orch.registry().get(&task_id).unwrap();
        assert_eq!(ctx.validation_failures.len(), 1);
        assert!(ctx.validation_failures[0].contains("weave context"));

        fx.orch.context(&task_id).unwrap();
        fx.orch.validate(&task_id).await.unwrap();
        assert!(fx.orch.registry().get(&task_id).unwrap().validation_failures.is_empty());
    }

    #[tokio::test]
    async fn test_status_refreshes_activity() {
        let fx = fixture();
        fx.orch
            .spawn(request("42", Role::Engineer), &CancellationToken::new())
            .await
            .unwrap();
        fx.vcs.add_commit(
            "task-42",
            Utc::now() + chrono::Duration::seconds(5),
            &["src/a.rs", "src/b.rs"],
        );
        let entries = fx.orch.status(Some("42")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].context.metrics.commit_count, 1);
        assert_eq!(entries[0].context.metrics.files_changed, 2);
        assert_eq!(entries[0].note.as_ref().unwrap().role, Role::Engineer);
        assert!(entries[0].workspace_present);
        assert_eq!(entries[0].threshold_hours, 24);
    }

    #[tokio::test]
    async fn test_issue_lifecycle_is_audited_and_synced() {
        let tracker = Arc::new(MockTracker::new());
        let fx = fixture_with(WeaveToml::default(), Some(tracker.clone()));
        let issue = fx
            .orch
            .create_issue(NewLocalIssue {
                title: "Write docs".into(),
                issue_type: IssueType::Docs,
                ..NewLocalIssue::default()
            })
            .unwrap();
        fx.orch.close_issue(issue.id).unwrap();

        let report = fx.orch.sync_engine().sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.synced, 1);
        let issue = fx.orch.show_issue(issue.id).unwrap();
        assert!(issue.synced);
        assert_eq!(
            &actions(&fx, &issue.task_id())[..2],
            &[AuditAction::IssueCreated, AuditAction::IssueClosed]
        );
    }

    #[test]
    fn test_unwritable_audit_leaves_issues_unchanged() {
        let fx = fixture();
        let kept = fx
            .orch
            .create_issue(NewLocalIssue {
                title: "Kept open".into(),
                ..NewLocalIssue::default()
            })
            .unwrap();
        let audit_file = fx.orch.config().audit_file.clone();
        std::fs::remove_file(&audit_file).unwrap();
        std::fs::create_dir(&audit_file).unwrap();

        let err = fx
            .orch
            .create_issue(NewLocalIssue {
                title: "Never stored".into(),
                ..NewLocalIssue::default()
            })
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::AuditUnavailable { .. }));
        let err = fx.orch.close_issue(kept.id).unwrap_err();
        assert!(matches!(err, OrchestrationError::AuditUnavailable { .. }));

        let issues = fx.orch.list_issues(&IssueFilter::default()).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].state, crate::sync::store::IssueState::Open);
    }

    #[test]
    fn test_show_missing_issue_is_not_found() {
        let fx = fixture();
        let err = fx.orch.show_issue(99).unwrap_err();
        assert!(matches!(err, OrchestrationError::NotFound { .. }));
    }
}
