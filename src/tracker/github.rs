//! GitHub REST implementation of [`Tracker`].

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{NewIssue, RemoteIssue, Tracker};
use crate::errors::TrackerError;
use crate::retry::RetryPolicy;
use crate::sync::store::IssueState;

const USER_AGENT: &str = "weave-orchestrator";

pub struct GitHubTracker {
    client: reqwest::Client,
    api_url: String,
    owner_repo: String,
    token: String,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct GitHubLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GitHubIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GitHubLabel>,
    state: String,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

impl From<GitHubIssue> for RemoteIssue {
    fn from(issue: GitHubIssue) -> Self {
        RemoteIssue {
            number: issue.number,
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            state: if issue.state.eq_ignore_ascii_case("closed") {
                IssueState::Closed
            } else {
                IssueState::Open
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedIssue {
    number: u64,
}

impl GitHubTracker {
    pub fn new(
        api_url: &str,
        owner: &str,
        repo: &str,
        token: &str,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, TrackerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrackerError::NotConfigured(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            owner_repo: format!("{}/{}", owner, repo),
            token: token.to_string(),
            retry,
        })
    }

    fn issues_url(&self) -> String {
        format!("{}/repos/{}/issues", self.api_url, self.owner_repo)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, TrackerError> {
        let resp = builder.send().await.map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let exhausted = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == "0");
        let message = resp.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, exhausted, message))
    }

    async fn create_once(&self, url: &str, issue: &NewIssue) -> Result<u64, TrackerError> {
        let resp = self
            .send(self.request(reqwest::Method::POST, url).json(issue))
            .await?;
        let created: CreatedIssue = resp.json().await.map_err(bad_response)?;
        Ok(created.number)
    }

    async fn patch_state(&self, url: &str, state: IssueState) -> Result<(), TrackerError> {
        let body = serde_json::json!({ "state": state.as_str() });
        self.send(self.request(reqwest::Method::PATCH, url).json(&body))
            .await?;
        Ok(())
    }

    async fn list_page(&self, url: &str, page: u32) -> Result<Vec<GitHubIssue>, TrackerError> {
        let page = page.to_string();
        let resp = self
            .send(self.request(reqwest::Method::GET, url).query(&[
                ("state", "all"),
                ("per_page", "100"),
                ("page", page.as_str()),
            ]))
            .await?;
        resp.json().await.map_err(bad_response)
    }
}

fn transport_error(err: reqwest::Error) -> TrackerError {
    TrackerError::Unavailable(err.to_string())
}

fn bad_response(err: reqwest::Error) -> TrackerError {
    TrackerError::Unavailable(format!("unreadable response: {}", err))
}

fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    rate_limit_exhausted: bool,
    message: String,
) -> TrackerError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && rate_limit_exhausted)
    {
        TrackerError::RateLimited { retry_after }
    } else if status.is_server_error() {
        TrackerError::Unavailable(format!("{} {}", status.as_u16(), message.trim()))
    } else {
        TrackerError::Rejected {
            status: status.as_u16(),
            message: message.trim().to_string(),
        }
    }
}

#[async_trait]
impl Tracker for GitHubTracker {
    fn name(&self) -> &str {
        "github"
    }

    async fn create_issue(&self, issue: &NewIssue) -> Result<u64, TrackerError> {
        let url = self.issues_url();
        let number = self
            .retry
            .run("tracker create issue", || self.create_once(&url, issue))
            .await?;
        debug!(number, "Created remote issue");
        Ok(number)
    }

    async fn update_status(&self, number: u64, state: IssueState) -> Result<(), TrackerError> {
        let url = format!("{}/{}", self.issues_url(), number);
        self.retry
            .run("tracker update status", || self.patch_state(&url, state))
            .await
    }

    async fn list_issues(&self) -> Result<Vec<RemoteIssue>, TrackerError> {
        let url = self.issues_url();
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let batch = self
                .retry
                .run("tracker list issues", || self.list_page(&url, page))
                .await?;
            let count = batch.len();
            all.extend(
                batch
                    .into_iter()
                    .filter(|i| i.pull_request.is_none())
                    .map(RemoteIssue::from),
            );
            if count < 100 {
                break;
            }
            page += 1;
        }
        Ok(all)
    }
}
