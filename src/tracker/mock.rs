//! In-memory `Tracker` for tests, with an online/offline switch.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{NewIssue, RemoteIssue, Tracker};
use crate::errors::TrackerError;
use crate::sync::store::IssueState;

pub struct MockTracker {
    online: AtomicBool,
    issues: Mutex<BTreeMap<u64, RemoteIssue>>,
    next_number: Mutex<u64>,
}

impl MockTracker {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            issues: Mutex::new(BTreeMap::new()),
            next_number: Mutex::new(100),
        }
    }

    pub fn offline() -> Self {
        let tracker = Self::new();
        tracker.set_online(false);
        tracker
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Seed an issue that exists only on the tracker.
    pub fn seed(&self, title: &str, labels: &[&str], state: IssueState) -> u64 {
        let number = self.take_number();
        self.issues.lock().unwrap().insert(
            number,
            RemoteIssue {
                number,
                title: title.to_string(),
                body: String::new(),
                labels: labels.iter().map(|l| l.to_string()).collect(),
                state,
            },
        );
        number
    }

    pub fn set_body(&self, number: u64, body: &str) {
        if let Some(issue) = self.issues.lock().unwrap().get_mut(&number) {
            issue.body = body.to_string();
        }
    }

    pub fn issue(&self, number: u64) -> Option<RemoteIssue> {
        self.issues.lock().unwrap().get(&number).cloned()
    }

    pub fn len(&self) -> usize {
        self.issues.lock().unwrap().len()
    }

    fn take_number(&self) -> u64 {
        let mut next = self.next_number.lock().unwrap();
        *next += 1;
        *next
    }

    fn check_online(&self) -> Result<(), TrackerError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TrackerError::Unavailable("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl Tracker for MockTracker {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_issue(&self, issue: &NewIssue) -> Result<u64, TrackerError> {
        self.check_online()?;
        let number = self.take_number();
        self.issues.lock().unwrap().insert(
            number,
            RemoteIssue {
                number,
                title: issue.title.clone(),
                body: issue.body.clone(),
                labels: issue.labels.clone(),
                state: IssueState::Open,
            },
        );
        Ok(number)
    }

    async fn update_status(&self, number: u64, state: IssueState) -> Result<(), TrackerError> {
        self.check_online()?;
        let mut issues = self.issues.lock().unwrap();
        let issue = issues.get_mut(&number).ok_or(TrackerError::Rejected {
            status: 404,
            message: "Not Found".to_string(),
        })?;
        issue.state = state;
        Ok(())
    }

    async fn list_issues(&self) -> Result<Vec<RemoteIssue>, TrackerError> {
        self.check_online()?;
        Ok(self.issues.lock().unwrap().values().cloned().collect())
    }
}
