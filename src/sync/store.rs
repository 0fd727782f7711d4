//! Offline issue store (`.weave/issues.json`).
//!
//! Issues get a monotonic local id that never changes, even after the issue
//! is bound to a remote tracker number. Every mutation reloads the file under
//! an advisory lock and replaces it atomically. A commit hook sees each
//! change before it is written, so an audit failure leaves the file as it was.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};
use tracing::debug;

use crate::errors::OrchestrationError;
use crate::role::Role;
use crate::util::{FileLock, atomic_write, is_contained_path};

pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_BODY_LEN: usize = 65_536;
pub const MAX_LABEL_LEN: usize = 50;

static TITLE_CONTROL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x1f\x7f]").expect("valid regex"));
static BODY_CONTROL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]").expect("valid regex"));
static LABEL_DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9:_\-]").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Epic,
    Feature,
    #[default]
    Story,
    Bug,
    Spike,
    Docs,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::Epic => "epic",
            IssueType::Feature => "feature",
            IssueType::Story => "story",
            IssueType::Bug => "bug",
            IssueType::Spike => "spike",
            IssueType::Docs => "docs",
        }
    }

    /// Role that picks up this kind of work when nothing more specific says otherwise.
    pub fn default_role(&self) -> Role {
        match self {
            IssueType::Epic => Role::Pm,
            IssueType::Feature | IssueType::Spike => Role::Architect,
            IssueType::Story | IssueType::Bug | IssueType::Docs => Role::Engineer,
        }
    }

    pub fn label(&self) -> String {
        format!("type:{}", self.as_str())
    }
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IssueType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().trim_start_matches("type:") {
            "epic" => Ok(IssueType::Epic),
            "feature" => Ok(IssueType::Feature),
            "story" => Ok(IssueType::Story),
            "bug" => Ok(IssueType::Bug),
            "spike" => Ok(IssueType::Spike),
            "docs" => Ok(IssueType::Docs),
            _ => anyhow::bail!(
                "Invalid issue type '{}'. Valid values: epic, feature, story, bug, spike, docs",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    #[default]
    Open,
    Closed,
}

impl IssueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueState::Open => "open",
            IssueState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for IssueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IssueState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "open" => Ok(IssueState::Open),
            "closed" => Ok(IssueState::Closed),
            _ => anyhow::bail!("Invalid issue state '{}'. Valid values: open, closed", s),
        }
    }
}

/// A task this issue depends on, with why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub task_id: String,
    #[serde(default)]
    pub explanation: String,
}

impl std::str::FromStr for Dependency {
    type Err = anyhow::Error;

    /// `<task>` or `<task>:<explanation>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (task, explanation) = s.split_once(':').unwrap_or((s, ""));
        let task = task.trim().trim_start_matches('#');
        if task.is_empty() {
            anyhow::bail!("Invalid dependency '{}'. Expected <task>[:<explanation>]", s);
        }
        Ok(Dependency {
            task_id: task.to_string(),
            explanation: explanation.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalIssue {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(rename = "type", default)]
    pub issue_type: IssueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default)]
    pub state: IssueState,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Paths (relative to the project root) of prior documents this task builds on.
    #[serde(default)]
    pub deliverables: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<u64>,
    #[serde(default)]
    pub synced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    /// Last state pushed to (or imported from) the tracker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_status: Option<IssueState>,
}

impl LocalIssue {
    /// Task id used by the orchestrator for this issue.
    pub fn task_id(&self) -> String {
        self.id.to_string()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }

    /// Closed locally but the tracker still thinks it is open.
    pub fn needs_status_push(&self) -> bool {
        self.synced && self.state == IssueState::Closed && self.remote_status != Some(IssueState::Closed)
    }
}

/// Input for [`LocalIssueStore::create`].
#[derive(Debug, Clone, Default)]
pub struct NewLocalIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub issue_type: IssueType,
    pub role: Option<Role>,
    pub acceptance_criteria: Vec<String>,
    pub dependencies: Vec<Dependency>,
    pub deliverables: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub state: Option<IssueState>,
    pub issue_type: Option<IssueType>,
    pub role: Option<Role>,
}

impl IssueFilter {
    fn matches(&self, issue: &LocalIssue) -> bool {
        self.state.is_none_or(|s| issue.state == s)
            && self.issue_type.is_none_or(|t| issue.issue_type == t)
            && self.role.is_none_or(|r| issue.role == Some(r))
    }
}

/// What a store write changed.
#[derive(Debug, Clone, PartialEq)]
pub enum IssueChange {
    Created,
    Closed,
    RemoteBound { remote_id: u64 },
    RemoteStatus { status: IssueState },
    Imported { remote_id: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssueEvent {
    pub issue: LocalIssue,
    pub change: IssueChange,
}

fn changed(issue: &LocalIssue, change: IssueChange) -> Option<IssueEvent> {
    Some(IssueEvent {
        issue: issue.clone(),
        change,
    })
}

/// Called with every change before it is persisted. An error aborts the
/// write.
pub type IssueHook = Box<dyn Fn(&IssueEvent) -> Result<(), OrchestrationError> + Send + Sync>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct IssueFile {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    issues: BTreeMap<u64, LocalIssue>,
}

impl IssueFile {
    fn allocate_id(&mut self) -> u64 {
        let floor = self.issues.keys().next_back().copied().unwrap_or(0);
        let id = self.next_id.max(floor) + 1;
        self.next_id = id;
        id
    }
}

pub struct LocalIssueStore {
    path: PathBuf,
    lock_path: PathBuf,
    writer: Mutex<()>,
    hook: Option<IssueHook>,
}

impl LocalIssueStore {
    pub fn new(path: &Path, lock_path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock_path: lock_path.to_path_buf(),
            writer: Mutex::new(()),
            hook: None,
        }
    }

    pub fn with_commit_hook(mut self, hook: IssueHook) -> Self {
        self.hook = Some(hook);
        self
    }

    fn load(&self) -> Result<IssueFile> {
        if !self.path.exists() {
            return Ok(IssueFile::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(IssueFile::default());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    fn persist(&self, file: &IssueFile) -> Result<()> {
        let json = serde_json::to_vec_pretty(file).context("Failed to serialize issues")?;
        atomic_write(&self.path, &json)
    }

    /// Run `mutate` against the freshly loaded file, pass its event to the
    /// commit hook, then persist. No event means nothing changed.
    fn update<T>(
        &self,
        mutate: impl FnOnce(&mut IssueFile) -> Result<(T, Option<IssueEvent>), OrchestrationError>,
    ) -> Result<T, OrchestrationError> {
        let _writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("issue store writer lock poisoned"))?;
        let _lock = FileLock::acquire(&self.lock_path)
            .map_err(|source| OrchestrationError::StorageUnavailable { source })?;
        let mut file = self
            .load()
            .map_err(|source| OrchestrationError::StorageUnavailable { source })?;
        let (out, event) = mutate(&mut file)?;
        let Some(event) = event else {
            return Ok(out);
        };
        if let Some(hook) = &self.hook {
            hook(&event)?;
        }
        self.persist(&file)
            .map_err(|source| OrchestrationError::StorageUnavailable { source })?;
        Ok(out)
    }

    pub fn create(&self, new: NewLocalIssue) -> Result<LocalIssue, OrchestrationError> {
        let title = sanitize_text(&new.title, MAX_TITLE_LEN, &TITLE_CONTROL)
            .ok_or_else(|| OrchestrationError::InvalidInput("title cannot be empty".into()))?;
        let body = sanitize_text(&new.body, MAX_BODY_LEN, &BODY_CONTROL).unwrap_or_default();

        let mut labels: Vec<String> = Vec::new();
        for label in new.labels.iter().filter_map(|l| sanitize_label(l)) {
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
        let type_label = new.issue_type.label();
        if !labels.contains(&type_label) {
            labels.push(type_label);
        }
        let acceptance_criteria = new
            .acceptance_criteria
            .iter()
            .filter_map(|c| sanitize_text(c, MAX_TITLE_LEN * 4, &TITLE_CONTROL))
            .collect();
        if let Some(bad) = new.deliverables.iter().find(|d| !is_contained_path(d)) {
            return Err(OrchestrationError::InvalidInput(format!(
                "deliverable '{}' must be a relative path inside the project",
                bad
            )));
        }

        self.update(|file| {
            let now = Utc::now();
            let issue = LocalIssue {
                id: file.allocate_id(),
                title,
                body,
                labels,
                issue_type: new.issue_type,
                role: new.role,
                state: IssueState::Open,
                acceptance_criteria,
                dependencies: new.dependencies,
                deliverables: new.deliverables,
                created_at: now,
                updated_at: now,
                remote_id: None,
                synced: false,
                synced_at: None,
                remote_status: None,
            };
            debug!(issue = issue.id, "Created local issue");
            file.issues.insert(issue.id, issue.clone());
            let event = changed(&issue, IssueChange::Created);
            Ok((issue, event))
        })
    }

    pub fn get(&self, id: u64) -> Result<Option<LocalIssue>> {
        Ok(self.load()?.issues.get(&id).cloned())
    }

    /// Look up an issue by task id (`12` or `#12`). Non-numeric ids have no issue.
    pub fn find(&self, task_id: &str) -> Result<Option<LocalIssue>> {
        match parse_issue_id(task_id) {
            Some(id) => self.get(id),
            None => Ok(None),
        }
    }

    pub fn list(&self, filter: &IssueFilter) -> Result<Vec<LocalIssue>> {
        Ok(self
            .load()?
            .issues
            .into_values()
            .filter(|issue| filter.matches(issue))
            .collect())
    }

    pub fn unsynced(&self) -> Result<Vec<LocalIssue>> {
        Ok(self
            .load()?
            .issues
            .into_values()
            .filter(|issue| !issue.synced)
            .collect())
    }

    pub fn close(&self, id: u64) -> Result<LocalIssue, OrchestrationError> {
        self.update(|file| {
            let issue = file
                .issues
                .get_mut(&id)
                .ok_or_else(|| OrchestrationError::NotFound {
                    task_id: id.to_string(),
                })?;
            if issue.state == IssueState::Closed {
                return Ok((issue.clone(), None));
            }
            issue.state = IssueState::Closed;
            issue.updated_at = Utc::now();
            let event = changed(issue, IssueChange::Closed);
            Ok((issue.clone(), event))
        })
    }

    /// Bind a local issue to its remote number. Re-binding to the same number
    /// is a no-op; binding to a different one is rejected.
    pub fn bind_remote(
        &self,
        id: u64,
        remote_id: u64,
        remote_status: IssueState,
    ) -> Result<LocalIssue, OrchestrationError> {
        self.update(|file| {
            let issue = file
                .issues
                .get_mut(&id)
                .ok_or_else(|| OrchestrationError::NotFound {
                    task_id: id.to_string(),
                })?;
            match issue.remote_id {
                Some(existing) if existing != remote_id => {
                    return Err(OrchestrationError::InvalidInput(format!(
                        "issue {} is already bound to remote #{}",
                        id, existing
                    )));
                }
                Some(_) => Ok((issue.clone(), None)),
                None => {
                    let now = Utc::now();
                    issue.remote_id = Some(remote_id);
                    issue.synced = true;
                    issue.synced_at = Some(now);
                    issue.remote_status = Some(remote_status);
                    issue.updated_at = now;
                    let event = changed(issue, IssueChange::RemoteBound { remote_id });
                    Ok((issue.clone(), event))
                }
            }
        })
    }

    pub fn set_remote_status(&self, id: u64, status: IssueState) -> Result<(), OrchestrationError> {
        self.update(|file| {
            let issue = file
                .issues
                .get_mut(&id)
                .ok_or_else(|| OrchestrationError::NotFound {
                    task_id: id.to_string(),
                })?;
            issue.remote_status = Some(status);
            issue.synced_at = Some(Utc::now());
            Ok(((), changed(issue, IssueChange::RemoteStatus { status })))
        })
    }

    /// Import a tracker issue not yet known locally. Returns `None` when an
    /// issue is already bound to `remote_id`.
    pub fn import_remote(
        &self,
        remote_id: u64,
        title: &str,
        body: &str,
        labels: &[String],
        state: IssueState,
    ) -> Result<Option<LocalIssue>, OrchestrationError> {
        let title = sanitize_text(title, MAX_TITLE_LEN, &TITLE_CONTROL)
            .unwrap_or_else(|| format!("Issue #{}", remote_id));
        let body = sanitize_text(body, MAX_BODY_LEN, &BODY_CONTROL).unwrap_or_default();
        let labels: Vec<String> = labels.iter().filter_map(|l| sanitize_label(l)).collect();
        let issue_type = labels
            .iter()
            .find_map(|l| l.strip_prefix("type:").and_then(|t| t.parse().ok()))
            .unwrap_or_default();
        let role = labels
            .iter()
            .find_map(|l| l.strip_prefix("role:").and_then(|r| r.parse().ok()));

        self.update(|file| {
            if file.issues.values().any(|i| i.remote_id == Some(remote_id)) {
                return Ok((None, None));
            }
            let now = Utc::now();
            let issue = LocalIssue {
                id: file.allocate_id(),
                title,
                body,
                labels,
                issue_type,
                role,
                state,
                acceptance_criteria: Vec::new(),
                dependencies: Vec::new(),
                deliverables: Vec::new(),
                created_at: now,
                updated_at: now,
                remote_id: Some(remote_id),
                synced: true,
                synced_at: Some(now),
                remote_status: Some(state),
            };
            file.issues.insert(issue.id, issue.clone());
            let event = changed(&issue, IssueChange::Imported { remote_id });
            Ok((Some(issue), event))
        })
    }
}

pub fn parse_issue_id(task_id: &str) -> Option<u64> {
    task_id.trim().trim_start_matches('#').parse().ok()
}

/// Strip control characters, trim, and cap at `max` characters. `None` when
/// nothing is left.
fn sanitize_text(text: &str, max: usize, control: &Regex) -> Option<String> {
    let cleaned = control.replace_all(text, "");
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return None;
    }
    let capped: String = trimmed.chars().take(max).collect();
    Some(capped.trim_end().to_string())
}

fn sanitize_label(label: &str) -> Option<String> {
    let lowered = label.trim().to_lowercase();
    let cleaned = LABEL_DISALLOWED.replace_all(&lowered, "");
    let capped: String = cleaned.chars().take(MAX_LABEL_LEN).collect();
    (!capped.is_empty()).then_some(capped)
}
