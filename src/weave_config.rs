//! Configuration file schema for weave.
//!
//! Settings live in `.weave/weave.toml`. Every section is optional and falls
//! back to the defaults shown here:
//!
//! ```toml
//! [project]
//! name = "my-project"
//! base_branch = "main"
//!
//! [workspace]
//! worktree_base = ".weave/worktrees"
//! git_timeout_secs = 60
//!
//! [context]
//! soft_limit_tokens = 24000
//! hard_limit_tokens = 32000
//! summary_lines = 20
//!
//! [routing]
//! api = ["api-design", "security", "testing", "documentation"]
//! default = ["testing", "security", "documentation"]
//!
//! [health]
//! stuck_threshold_hours = 24
//! scan_interval_secs = 1800
//!
//! [health.thresholds]
//! bug = 12
//! epic = 72
//!
//! [gates.thresholds]
//! engineer = 1.0
//! reviewer = 0.75
//!
//! [tracker]
//! provider = "github"
//! owner = "acme"
//! repo = "widgets"
//! token_env = "GITHUB_TOKEN"
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//!
//! [sync]
//! interval_secs = 900
//! ```
//!
//! The numeric ceilings and backoff schedule are tuning, not protocol; they
//! are configuration so each project can pick its own.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::context::routing::RoutingTable;
use crate::role::Role;

/// Name of the configuration file inside `.weave/`.
pub const CONFIG_FILE: &str = "weave.toml";

/// Project-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project name (optional, defaults to directory name)
    #[serde(default)]
    pub name: Option<String>,
    /// Revision new workspaces branch from (default: HEAD)
    #[serde(default)]
    pub base_branch: Option<String>,
}

/// Workspace (worktree) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSection {
    /// Directory holding task worktrees, relative to the project root
    #[serde(default = "default_worktree_base")]
    pub worktree_base: String,
    /// Timeout for a single git subprocess
    #[serde(default = "default_git_timeout_secs")]
    pub git_timeout_secs: u64,
}

fn default_worktree_base() -> String {
    ".weave/worktrees".to_string()
}

fn default_git_timeout_secs() -> u64 {
    60
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            worktree_base: default_worktree_base(),
            git_timeout_secs: default_git_timeout_secs(),
        }
    }
}

/// Context artifact size limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    /// Above this the artifact is flagged `oversized`
    #[serde(default = "default_soft_limit")]
    pub soft_limit_tokens: usize,
    /// Above this assembly fails and no artifact is written
    #[serde(default = "default_hard_limit")]
    pub hard_limit_tokens: usize,
    /// Maximum lines kept from each prior deliverable
    #[serde(default = "default_summary_lines")]
    pub summary_lines: usize,
}

fn default_soft_limit() -> usize {
    24_000
}

fn default_hard_limit() -> usize {
    32_000
}

fn default_summary_lines() -> usize {
    20
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            soft_limit_tokens: default_soft_limit(),
            hard_limit_tokens: default_hard_limit(),
            summary_lines: default_summary_lines(),
        }
    }
}

/// Stuck detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    /// Hours of inactivity before a context counts as stuck
    #[serde(default = "default_stuck_threshold_hours")]
    pub stuck_threshold_hours: u64,
    /// Per issue type overrides (bug, story, feature, epic, spike, docs)
    #[serde(default = "default_type_thresholds")]
    pub thresholds: BTreeMap<String, u64>,
    /// Interval of the background scan loop
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

fn default_stuck_threshold_hours() -> u64 {
    24
}

fn default_type_thresholds() -> BTreeMap<String, u64> {
    [
        ("bug", 12),
        ("story", 24),
        ("feature", 48),
        ("epic", 72),
        ("spike", 36),
        ("docs", 18),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_scan_interval_secs() -> u64 {
    1800
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            stuck_threshold_hours: default_stuck_threshold_hours(),
            thresholds: default_type_thresholds(),
            scan_interval_secs: default_scan_interval_secs(),
        }
    }
}

impl HealthSection {
    /// Threshold for an issue type, falling back to the global default.
    pub fn threshold_for(&self, issue_type: Option<&str>) -> u64 {
        issue_type
            .and_then(|t| self.thresholds.get(&t.to_lowercase()))
            .copied()
            .unwrap_or(self.stuck_threshold_hours)
    }
}

/// Validation gate settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatesSection {
    /// Minimum satisfied ratio of the role's DoD criteria (0.0-1.0), keyed by role
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
}

impl GatesSection {
    pub fn threshold_for(&self, role: Role) -> f64 {
        self.thresholds.get(role.as_str()).copied().unwrap_or(1.0)
    }
}

/// Which remote tracker to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerProvider {
    /// Offline only; sync reports the tracker as unavailable
    #[default]
    None,
    Github,
}

/// Remote tracker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSection {
    #[serde(default)]
    pub provider: TrackerProvider,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Environment variable holding the API token
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_tracker_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_tracker_timeout_secs() -> u64 {
    30
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            provider: TrackerProvider::default(),
            owner: None,
            repo: None,
            api_url: default_api_url(),
            token_env: default_token_env(),
            timeout_secs: default_tracker_timeout_secs(),
        }
    }
}

/// Backoff schedule for transient collaborator failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Background sync loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
}

fn default_sync_interval_secs() -> u64 {
    900
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval_secs(),
        }
    }
}

/// The complete weave.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeaveToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub context: ContextSection,
    /// Label -> knowledge sections. Empty means the built-in table.
    #[serde(default)]
    pub routing: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub gates: GatesSection,
    #[serde(default)]
    pub tracker: TrackerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub sync: SyncSection,
}

impl WeaveToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse weave.toml")
    }

    /// Load configuration from `<weave_dir>/weave.toml`, or defaults if absent.
    pub fn load_or_default(weave_dir: &Path) -> Result<Self> {
        let config_path = weave_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize weave.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// The routing table, validated. An empty `[routing]` section selects the
    /// built-in table.
    pub fn routing_table(&self) -> Result<RoutingTable> {
        if self.routing.is_empty() {
            Ok(RoutingTable::builtin())
        } else {
            RoutingTable::from_config(&self.routing)
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.context.hard_limit_tokens == 0 {
            warnings.push("context.hard_limit_tokens must be greater than 0".to_string());
        }
        if self.context.soft_limit_tokens > self.context.hard_limit_tokens {
            warnings.push(format!(
                "context.soft_limit_tokens ({}) is above hard_limit_tokens ({})",
                self.context.soft_limit_tokens, self.context.hard_limit_tokens
            ));
        }

        if let Err(e) = self.routing_table() {
            warnings.push(format!("Invalid [routing] table: {:#}", e));
        }

        for (role, threshold) in &self.gates.thresholds {
            if role.parse::<Role>().is_err() {
                warnings.push(format!("Unknown role '{}' in [gates.thresholds]", role));
            }
            if !(0.0..=1.0).contains(threshold) {
                warnings.push(format!(
                    "Gate threshold for '{}' must be between 0.0 and 1.0, got {}",
                    role, threshold
                ));
            }
        }

        if self.tracker.provider == TrackerProvider::Github
            && (self.tracker.owner.is_none() || self.tracker.repo.is_none())
        {
            warnings.push("tracker.provider = \"github\" requires owner and repo".to_string());
        }

        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            warnings.push("retry.base_delay_ms is above retry.max_delay_ms".to_string());
        }

        warnings
    }
}
