//! Remote issue tracker boundary.

pub mod github;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Config;
use crate::errors::TrackerError;
use crate::retry::RetryPolicy;
use crate::sync::store::IssueState;
use crate::weave_config::TrackerProvider;

pub use github::GitHubTracker;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteIssue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub state: IssueState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[async_trait]
pub trait Tracker: Send + Sync {
    /// Short name for logs and reports.
    fn name(&self) -> &str;

    /// Create an issue and return its remote number.
    async fn create_issue(&self, issue: &NewIssue) -> Result<u64, TrackerError>;

    async fn update_status(&self, number: u64, state: IssueState) -> Result<(), TrackerError>;

    async fn list_issues(&self) -> Result<Vec<RemoteIssue>, TrackerError>;
}

/// Build the tracker configured in `[tracker]`, if any.
pub fn from_config(config: &Config) -> Result<Option<Arc<dyn Tracker>>, TrackerError> {
    let section = &config.toml.tracker;
    match section.provider {
        TrackerProvider::None => Ok(None),
        TrackerProvider::Github => {
            let (Some(owner), Some(repo)) = (section.owner.as_deref(), section.repo.as_deref())
            else {
                return Err(TrackerError::NotConfigured(
                    "[tracker] provider = \"github\" requires owner and repo".to_string(),
                ));
            };
            let token = config.tracker_token().ok_or_else(|| {
                TrackerError::NotConfigured(format!(
                    "no token found in WEAVE_GITHUB_TOKEN or {}",
                    section.token_env
                ))
            })?;
            let tracker = GitHubTracker::new(
                &section.api_url,
                owner,
                repo,
                &token,
                std::time::Duration::from_secs(section.timeout_secs),
                RetryPolicy::from_config(&config.toml.retry),
            )?;
            Ok(Some(Arc::new(tracker)))
        }
    }
}
