//! Reconciles the offline issue store with the remote tracker.
//!
//! A pass has three phases: pull tracker issues that are unknown locally,
//! push issues that have never been synced, then push local closes the
//! tracker has not seen. Every pushed body carries a local-id marker, so a
//! remote issue whose binding was never written is bound on the next pull
//! instead of being imported as a copy. An unreachable tracker ends the pass
//! early and is reported, never raised.
//!
//! Store changes are audited by [`issue_audit_hook`] before they are written.

pub mod store;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditLog};
use crate::errors::{OrchestrationError, TrackerError};
use crate::retry::Transience;
use crate::tracker::{NewIssue, Tracker};
use store::{IssueChange, IssueEvent, IssueHook, IssueState, LocalIssue, LocalIssueStore};

const ACTOR: &str = "sync";
const LOCAL_ID_MARKER: &str = "weave-local-id:";

/// Actor, audit action and result text for an issue store change.
pub fn issue_audit_record(event: &IssueEvent) -> (&'static str, AuditAction, String) {
    let issue = &event.issue;
    match &event.change {
        IssueChange::Created => (
            crate::orchestrator::engine::ACTOR,
            AuditAction::IssueCreated,
            format!("{} [{}]", issue.title, issue.issue_type),
        ),
        IssueChange::Closed => (
            crate::orchestrator::engine::ACTOR,
            AuditAction::IssueClosed,
            "closed locally".to_string(),
        ),
        IssueChange::RemoteBound { remote_id } => (
            ACTOR,
            AuditAction::Synced,
            format!("bound to remote #{}", remote_id),
        ),
        IssueChange::RemoteStatus { status } => (
            ACTOR,
            AuditAction::Synced,
            match status {
                IssueState::Closed => format!("closed remote #{}", issue.remote_id.unwrap_or_default()),
                IssueState::Open => format!("reopened remote #{}", issue.remote_id.unwrap_or_default()),
            },
        ),
        IssueChange::Imported { remote_id } => (
            ACTOR,
            AuditAction::Synced,
            format!("imported remote #{}", remote_id),
        ),
    }
}

/// Commit hook that appends the audit entry for each issue change before
/// the store persists it.
pub fn issue_audit_hook(audit: Arc<AuditLog>) -> IssueHook {
    Box::new(move |event: &IssueEvent| {
        let (actor, action, result) = issue_audit_record(event);
        audit.append(actor, action, Some(&event.issue.task_id()), &result)?;
        Ok(())
    })
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncReport {
    /// Local issues newly bound to a remote number
    pub synced: usize,
    /// Local closes pushed to the tracker
    pub closed: usize,
    /// Tracker issues imported locally
    pub imported: usize,
    /// Issues the tracker refused, with the reason
    pub rejected: Vec<(u64, String)>,
    /// Why the tracker could not be reached, if it could not
    pub unavailable: Option<String>,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn tracker_available(&self) -> bool {
        self.unavailable.is_none()
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} synced", self.synced)?;
        if self.closed > 0 {
            write!(f, ", {} closed", self.closed)?;
        }
        if self.imported > 0 {
            write!(f, ", {} imported", self.imported)?;
        }
        if !self.rejected.is_empty() {
            write!(f, ", {} rejected", self.rejected.len())?;
        }
        if self.unavailable.is_some() {
            write!(f, ", tracker unavailable")?;
        }
        if self.cancelled {
            write!(f, ", cancelled")?;
        }
        Ok(())
    }
}

enum PhaseOutcome {
    Continue,
    Stop,
}

pub struct SyncEngine {
    store: Arc<LocalIssueStore>,
    tracker: Option<Arc<dyn Tracker>>,
}

impl SyncEngine {
    pub fn new(store: Arc<LocalIssueStore>, tracker: Option<Arc<dyn Tracker>>) -> Self {
        Self { store, tracker }
    }

    /// One reconciliation pass.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<SyncReport, OrchestrationError> {
        let mut report = SyncReport::default();
        let Some(tracker) = self.tracker.clone() else {
            report.unavailable = Some("no tracker configured".to_string());
            return Ok(report);
        };

        for phase in [Phase::Pull, Phase::Push, Phase::Status] {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let outcome = match phase {
                Phase::Pull => self.pull(tracker.as_ref(), &mut report).await?,
                Phase::Push => self.push_new(tracker.as_ref(), cancel, &mut report).await?,
                Phase::Status => self.push_status(tracker.as_ref(), cancel, &mut report).await?,
            };
            if let PhaseOutcome::Stop = outcome {
                break;
            }
        }

        info!(tracker = tracker.name(), report = %report, "Sync pass finished");
        Ok(report)
    }

    async fn push_new(
        &self,
        tracker: &dyn Tracker,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<PhaseOutcome, OrchestrationError> {
        for issue in self.store.unsynced()? {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(PhaseOutcome::Stop);
            }
            let request = NewIssue {
                title: issue.title.clone(),
                body: remote_body(&issue),
                labels: issue.labels.clone(),
            };
            match tracker.create_issue(&request).await {
                Ok(number) => {
                    self.store.bind_remote(issue.id, number, IssueState::Open)?;
                    debug!(issue = issue.id, remote = number, "Issue pushed");
                    report.synced += 1;
                }
                Err(err) => {
                    if let Some(outcome) = Self::handle_failure(issue.id, err, report) {
                        return Ok(outcome);
                    }
                }
            }
        }
        Ok(PhaseOutcome::Continue)
    }

    async fn push_status(
        &self,
        tracker: &dyn Tracker,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<PhaseOutcome, OrchestrationError> {
        let pending: Vec<LocalIssue> = self
            .store
            .list(&Default::default())?
            .into_iter()
            .filter(LocalIssue::needs_status_push)
            .collect();
        for issue in pending {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(PhaseOutcome::Stop);
            }
            let Some(number) = issue.remote_id else {
                continue;
            };
            match tracker.update_status(number, IssueState::Closed).await {
                Ok(()) => {
                    self.store.set_remote_status(issue.id, IssueState::Closed)?;
                    report.closed += 1;
                }
                Err(err) => {
                    if let Some(outcome) = Self::handle_failure(issue.id, err, report) {
                        return Ok(outcome);
                    }
                }
            }
        }
        Ok(PhaseOutcome::Continue)
    }

    async fn pull(
        &self,
        tracker: &dyn Tracker,
        report: &mut SyncReport,
    ) -> Result<PhaseOutcome, OrchestrationError> {
        let remote = match tracker.list_issues().await {
            Ok(remote) => remote,
            Err(err) => {
                return Ok(Self::handle_failure(0, err, report).unwrap_or(PhaseOutcome::Continue));
            }
        };
        for issue in remote {
            if let Some(local) = self.unbound_origin(&issue.body, &issue.title)? {
                self.store.bind_remote(local.id, issue.number, issue.state)?;
                debug!(issue = local.id, remote = issue.number, "Bound pushed issue from marker");
                report.synced += 1;
                continue;
            }
            if self
                .store
                .import_remote(issue.number, &issue.title, &issue.body, &issue.labels, issue.state)?
                .is_some()
            {
                report.imported += 1;
            }
        }
        Ok(PhaseOutcome::Continue)
    }

    /// The unbound local issue a remote body was pushed from, if its marker
    /// names one with the same title.
    fn unbound_origin(&self, body: &str, title: &str) -> Result<Option<LocalIssue>, OrchestrationError> {
        let Some(id) = local_id_marker(body) else {
            return Ok(None);
        };
        Ok(self
            .store
            .get(id)?
            .filter(|local| local.remote_id.is_none() && local.title == title))
    }

    /// Record a tracker failure. Transient failures stop the pass.
    fn handle_failure(issue: u64, err: TrackerError, report: &mut SyncReport) -> Option<PhaseOutcome> {
        if err.is_transient() || matches!(err, TrackerError::NotConfigured(_)) {
            warn!(error = %err, "Tracker unavailable, stopping sync pass");
            report.unavailable = Some(err.to_string());
            Some(PhaseOutcome::Stop)
        } else {
            warn!(issue, error = %err, "Tracker rejected issue");
            report.rejected.push((issue, err.to_string()));
            None
        }
    }

    /// Sync on `interval` until cancelled.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sync(&cancel).await {
                        Ok(report) => debug!(report = %report, "Background sync"),
                        Err(e) => warn!(error = %e, "Background sync failed"),
                    }
                }
            }
        }
        info!("Sync loop stopped");
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Pull,
    Push,
    Status,
}

/// Body sent to the tracker: the description plus the structured fields the
/// tracker has no place for.
fn remote_body(issue: &LocalIssue) -> String {
    let mut body = issue.body.clone();
    if !issue.acceptance_criteria.is_empty() {
        if !body.is_empty() {
            body.push_str("\n\n");
        }
        body.push_str("## Acceptance Criteria\n");
        for criterion in &issue.acceptance_criteria {
            body.push_str(&format!("- [ ] {}\n", criterion));
        }
    }
    if !issue.dependencies.is_empty() {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("## Dependencies\n");
        for dep in &issue.dependencies {
            if dep.explanation.is_empty() {
                body.push_str(&format!("- #{}\n", dep.task_id));
            } else {
                body.push_str(&format!("- #{}: {}\n", dep.task_id, dep.explanation));
            }
        }
    }
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }
    body.push_str(&format!("\n<!-- {} {} -->\n", LOCAL_ID_MARKER, issue.id));
    body
}

fn local_id_marker(body: &str) -> Option<u64> {
    body.lines().rev().find_map(|line| {
        line.trim()
            .strip_prefix("<!--")?
            .strip_suffix("-->")?
            .trim()
            .strip_prefix(LOCAL_ID_MARKER)?
            .trim()
            .parse()
            .ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::mock::MockTracker;
    use store::{NewLocalIssue, parse_issue_id};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        store: Arc<LocalIssueStore>,
        audit: Arc<AuditLog>,
        tracker: Arc<MockTracker>,
    }

    impl Fixture {
        fn new(tracker: MockTracker) -> Self {
            let dir = tempdir().unwrap();
            let audit = Arc::new(AuditLog::new(
                &dir.path().join("audit.jsonl"),
                &dir.path().join("audit.lock"),
            ));
            let store = Arc::new(
                LocalIssueStore::new(&dir.path().join("issues.json"), &dir.path().join("issues.lock"))
                    .with_commit_hook(issue_audit_hook(audit.clone())),
            );
            Self {
                _dir: dir,
                store,
                audit,
                tracker: Arc::new(tracker),
            }
        }

        fn engine(&self) -> SyncEngine {
            SyncEngine::new(self.store.clone(), Some(self.tracker.clone() as Arc<dyn Tracker>))
        }

        fn create(&self, title: &str) -> LocalIssue {
            self.store
                .create(NewLocalIssue {
                    title: title.to_string(),
                    acceptance_criteria: vec!["works".to_string()],
                    ..Default::default()
                })
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_offline_then_online() {
        let fx = Fixture::new(MockTracker::offline());
        let issue = fx.create("Offline work");

        let report = fx.engine().sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.to_string(), "0 synced, tracker unavailable");
        assert!(!fx.store.get(issue.id).unwrap().unwrap().synced);

        fx.tracker.set_online(true);
        let report = fx.engine().sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(report.tracker_available());

        let stored = fx.store.get(issue.id).unwrap().unwrap();
        assert!(stored.synced);
        assert_eq!(stored.id, issue.id);
        let remote = fx.tracker.issue(stored.remote_id.unwrap()).unwrap();
        assert_eq!(remote.title, "Offline work");
        assert!(remote.body.contains("- [ ] works"));
    }

    #[tokio::test]
    async fn test_no_tracker_reports_unavailable() {
        let fx = Fixture::new(MockTracker::new());
        fx.create("x");
        let engine = SyncEngine::new(fx.store.clone(), None);
        let report = engine.sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.to_string(), "0 synced, tracker unavailable");
    }

    #[tokio::test]
    async fn test_second_pass_is_a_noop() {
        let fx = Fixture::new(MockTracker::new());
        fx.create("once");
        fx.engine().sync(&CancellationToken::new()).await.unwrap();
        let report = fx.engine().sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.imported, 0);
        assert_eq!(fx.tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_issue_status_is_pushed() {
        let fx = Fixture::new(MockTracker::new());
        let issue = fx.create("close me");
        fx.engine().sync(&CancellationToken::new()).await.unwrap();
        fx.store.close(issue.id).unwrap();

        let report = fx.engine().sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.closed, 1);
        let remote_id = fx.store.get(issue.id).unwrap().unwrap().remote_id.unwrap();
        assert_eq!(fx.tracker.issue(remote_id).unwrap().state, IssueState::Closed);
    }

    #[tokio::test]
    async fn test_pull_imports_remote_only_issues() {
        let fx = Fixture::new(MockTracker::new());
        let number = fx.tracker.seed("From the web", &["type:bug"], IssueState::Open);
        let report = fx.engine().sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.imported, 1);
        let local = fx.store.list(&Default::default()).unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].remote_id, Some(number));
        assert!(local[0].synced);
    }

    #[tokio::test]
    async fn test_sync_is_audited() {
        let fx = Fixture::new(MockTracker::new());
        let issue = fx.create("audited");
        fx.engine().sync(&CancellationToken::new()).await.unwrap();
        let entries = fx.audit.tail(10, Some(&issue.task_id())).unwrap();
        let actions: Vec<AuditAction> = entries.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::IssueCreated, AuditAction::Synced]);
        assert_eq!(entries[1].actor, "sync");
        assert_eq!(fx.audit.verify().unwrap(), None);
    }

    #[tokio::test]
    async fn test_unwritten_binding_is_recovered_not_duplicated() {
        let fx = Fixture::new(MockTracker::new());
        let issue = fx.create("pushed once");
        let audit_path = fx._dir.path().join("audit.jsonl");
        std::fs::remove_file(&audit_path).unwrap();
        std::fs::create_dir(&audit_path).unwrap();

        let err = fx.engine().sync(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::AuditUnavailable { .. }));
        assert_eq!(fx.tracker.len(), 1);
        assert!(!fx.store.get(issue.id).unwrap().unwrap().synced);

        std::fs::remove_dir(&audit_path).unwrap();
        let report = fx.engine().sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.imported, 0);
        assert_eq!(fx.tracker.len(), 1);
        let local = fx.store.list(&Default::default()).unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].id, issue.id);
        assert!(local[0].synced);

        let again = fx.engine().sync(&CancellationToken::new()).await.unwrap();
        assert_eq!((again.synced, again.imported), (0, 0));
        assert_eq!(fx.tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_marker_for_other_title_is_imported() {
        let fx = Fixture::new(MockTracker::new());
        let local = fx.create("mine");
        let number = fx.tracker.seed("theirs", &[], IssueState::Open);
        // A foreign marker that happens to name a local id.
        fx.tracker.set_body(number, &format!("<!-- {} {} -->", LOCAL_ID_MARKER, local.id));
        let report = fx.engine().sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(report.synced, 1);
        assert_eq!(fx.store.list(&Default::default()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_pass_stops_early() {
        let fx = Fixture::new(MockTracker::new());
        fx.create("never sent");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = fx.engine().sync(&cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(fx.tracker.len(), 0);
    }

    #[test]
    fn test_remote_body_includes_structure() {
        let now = chrono::Utc::now();
        let issue = LocalIssue {
            id: 3,
            title: "t".into(),
            body: "Do it".into(),
            labels: vec![],
            issue_type: Default::default(),
            role: None,
            state: IssueState::Open,
            acceptance_criteria: vec!["a".into()],
            dependencies: vec!["#1:schema".parse().unwrap()],
            deliverables: vec![],
            created_at: now,
            updated_at: now,
            remote_id: None,
            synced: false,
            synced_at: None,
            remote_status: None,
        };
        let body = remote_body(&issue);
        assert!(body.starts_with("Do it\n\n## Acceptance Criteria\n- [ ] a\n"));
        assert!(body.contains("- #1: schema"));
        assert!(body.ends_with("\n<!-- weave-local-id: 3 -->\n"));
        assert_eq!(local_id_marker(&body), Some(3));
        assert_eq!(local_id_marker("no marker here"), None);
        assert_eq!(parse_issue_id("#3"), Some(issue.id));
    }
}
