//! Stuck-context detection.
//!
//! A context's effective last activity is the latest of its recorded
//! activity, the last commit on its branch, and the last audit entry that
//! mentions it (escalations excluded). A breach is escalated once; the next
//! escalation needs new activity first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditLog};
use crate::errors::OrchestrationError;
use crate::orchestrator::state::{ActivityUpdate, ExecutionContext, LifecycleState, Registry};
use crate::role::Role;
use crate::vcs::{Vcs, summarize_commits};
use crate::weave_config::HealthSection;

/// Derived view of one context's liveness.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub task_id: String,
    pub role: Role,
    pub state: LifecycleState,
    pub last_activity: DateTime<Utc>,
    pub idle_hours: f64,
    pub threshold_hours: u64,
    pub escalated: bool,
}

impl HealthRecord {
    pub fn is_stuck(&self) -> bool {
        self.idle_hours > self.threshold_hours as f64
    }
}

/// A newly escalated breach.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StuckReport {
    pub task_id: String,
    pub role: Role,
    pub branch: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub idle_hours: f64,
    pub threshold_hours: u64,
}

impl std::fmt::Display for StuckReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "task {} ({}) idle {:.1}h, threshold {}h",
            self.task_id, self.role, self.idle_hours, self.threshold_hours
        )
    }
}

/// Pull commit count, files changed and last commit time from the VCS into
/// the registry. VCS failures leave the record as it was.
pub async fn refresh_activity(
    registry: &Registry,
    vcs: &dyn Vcs,
    ctx: &ExecutionContext,
) -> Result<(ExecutionContext, Option<DateTime<Utc>>), OrchestrationError> {
    let Some(branch) = ctx.branch.as_deref() else {
        return Ok((ctx.clone(), None));
    };
    let commits = match vcs.commits_since(branch, ctx.created_at).await {
        Ok(commits) => commits,
        Err(e) => {
            debug!(task_id = %ctx.task_id, branch, error = %e, "could not read commits");
            return Ok((ctx.clone(), None));
        }
    };
    let last_commit = commits.iter().map(|c| c.time).max();
    let update = ActivityUpdate {
        metrics: summarize_commits(&commits),
        last_commit,
    };
    let refreshed = registry.record_activity(&ctx.task_id, update)?;
    Ok((refreshed, last_commit))
}

pub struct HealthMonitor {
    registry: Arc<Registry>,
    vcs: Arc<dyn Vcs>,
    audit: Arc<AuditLog>,
    settings: HealthSection,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<Registry>,
        vcs: Arc<dyn Vcs>,
        audit: Arc<AuditLog>,
        settings: HealthSection,
    ) -> Self {
        Self {
            registry,
            vcs,
            audit,
            settings,
        }
    }

    fn last_audited(&self, task_id: &str) -> Option<DateTime<Utc>> {
        let query = match self.audit.query(Some(task_id)) {
            Ok(query) => query,
            Err(e) => {
                warn!(task_id, error = %e, "could not read audit log");
                return None;
            }
        };
        query
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.action != AuditAction::Escalated)
            .map(|entry| entry.timestamp)
            .max()
    }

    async fn record_for(
        &self,
        ctx: &ExecutionContext,
        now: DateTime<Utc>,
    ) -> Result<(HealthRecord, ExecutionContext), OrchestrationError> {
        let (ctx, last_commit) = refresh_activity(&self.registry, self.vcs.as_ref(), ctx).await?;
        let last_activity = [
            Some(ctx.last_activity),
            last_commit,
            self.last_audited(&ctx.task_id),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(ctx.last_activity);
        let idle_hours = (now - last_activity).num_seconds().max(0) as f64 / 3600.0;
        let record = HealthRecord {
            task_id: ctx.task_id.clone(),
            role: ctx.role,
            state: ctx.state,
            last_activity,
            idle_hours,
            threshold_hours: self.settings.threshold_for(ctx.issue_type.as_deref()),
            escalated: ctx.escalated_for == Some(last_activity),
        };
        Ok((record, ctx))
    }

    /// Liveness of every non-terminal context, without escalating.
    pub async fn check(&self, now: DateTime<Utc>) -> Result<Vec<HealthRecord>, OrchestrationError> {
        let mut records = Vec::new();
        for ctx in self.registry.list_active() {
            records.push(self.record_for(&ctx, now).await?.0);
        }
        Ok(records)
    }

    pub async fn scan(&self) -> Result<Vec<StuckReport>, OrchestrationError> {
        self.scan_at(Utc::now()).await
    }

    /// Escalate every breach not escalated yet. Returns only new escalations.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> Result<Vec<StuckReport>, OrchestrationError> {
        let mut reports = Vec::new();
        for ctx in self.registry.list_active() {
            let (record, ctx) = self.record_for(&ctx, now).await?;
            if !record.is_stuck() || record.escalated {
                continue;
            }
            self.registry
                .mark_escalated(&ctx.task_id, record.last_activity, record.idle_hours)?;
            let report = StuckReport {
                task_id: ctx.task_id.clone(),
                role: ctx.role,
                branch: ctx.branch.clone(),
                last_activity: record.last_activity,
                idle_hours: record.idle_hours,
                threshold_hours: record.threshold_hours,
            };
            warn!(task_id = %report.task_id, idle_hours = report.idle_hours, "context stuck; escalated");
            reports.push(report);
        }
        Ok(reports)
    }

    /// Scan on `interval` until cancelled.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.scan().await {
                        Ok(reports) => debug!(escalated = reports.len(), "health scan"),
                        Err(e) => warn!(error = %e, "health scan failed"),
                    }
                }
            }
        }
        info!("Health monitor stopped");
    }
}
