//! Append-only, hash-chained audit trail of orchestration actions.

pub mod logger;

pub use logger::{AuditLog, AuditQuery};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Registered,
    Allocated,
    Activated,
    Handoff,
    Completed,
    Failed,
    Released,
    Recovered,
    Escalated,
    Validated,
    ContextAssembled,
    IssueCreated,
    IssueClosed,
    Synced,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Registered => "registered",
            AuditAction::Allocated => "allocated",
            AuditAction::Activated => "activated",
            AuditAction::Handoff => "handoff",
            AuditAction::Completed => "completed",
            AuditAction::Failed => "failed",
            AuditAction::Released => "released",
            AuditAction::Recovered => "recovered",
            AuditAction::Escalated => "escalated",
            AuditAction::Validated => "validated",
            AuditAction::ContextAssembled => "context_assembled",
            AuditAction::IssueCreated => "issue_created",
            AuditAction::IssueClosed => "issue_closed",
            AuditAction::Synced => "synced",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of `audit.jsonl`. Never edited once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// 1-based position in the chain.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub result: String,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// Build the successor of the entry with `prev_hash` at position `seq`.
    pub fn new(
        seq: u64,
        actor: &str,
        action: AuditAction,
        task_id: Option<&str>,
        result: &str,
        prev_hash: &str,
    ) -> Self {
        let mut entry = Self {
            seq,
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action,
            task_id: task_id.map(str::to_string),
            result: result.to_string(),
            prev_hash: prev_hash.to_string(),
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        entry
    }

    /// SHA-256 over `seq|timestamp|actor|action|task_id|result|prev_hash`.
    pub fn compute_hash(&self) -> String {
        let material = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.seq,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.actor,
            self.action.as_str(),
            self.task_id.as_deref().unwrap_or(""),
            self.result,
            self.prev_hash
        );
        let mut hasher = Sha256::new();
        hasher.update(material.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn is_intact(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_hash_is_stable_across_serde() {
        let entry = AuditEntry::new(
            1,
            "tester",
            AuditAction::Registered,
            Some("42"),
            "ok",
            GENESIS_HASH,
        );
        assert_eq!(entry.hash.len(), 64);
        assert!(entry.is_intact());

        let json = serde_json::to_string(&entry).unwrap();
        let back: AuditEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
        assert!(back.is_intact());
    }

    #[test]
    fn test_any_field_change_breaks_the_hash() {
        let mut entry =
            AuditEntry::new(1, "tester", AuditAction::Failed, Some("7"), "boom", GENESIS_HASH);
        entry.result = "fine".to_string();
        assert!(!entry.is_intact());
    }

    #[test]
    fn test_action_serializes_snake_case() {
        let json = serde_json::to_string(&AuditAction::ContextAssembled).unwrap();
        assert_eq!(json, "\"context_assembled\"");
        assert_eq!(AuditAction::ContextAssembled.to_string(), "context_assembled");
    }
}
