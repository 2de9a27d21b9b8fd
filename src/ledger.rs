//! Append-only issue ledger (`issues.jsonl`).

use crate::error::{ErrorKind, Result};
use crate::issue::{IssueId, IssueKind};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Final outcome recorded for an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueOutcome {
    Success,
    Failed,
}

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    IssueCreated {
        id: IssueId,
        at: DateTime<Utc>,
        source: String,
        sig: String,
        kind: IssueKind,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rerun_of: Option<IssueId>,
    },
    AttemptStart {
        id: IssueId,
        at: DateTime<Utc>,
        attempt: u32,
        branch: String,
        base_ref: String,
    },
    AttemptFailed {
        id: IssueId,
        at: DateTime<Utc>,
        attempt: u32,
        error: String,
        kind: ErrorKind,
    },
    Pushed {
        id: IssueId,
        at: DateTime<Utc>,
        attempt: u32,
        branch: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha: Option<String>,
    },
    IssueFinished {
        id: IssueId,
        at: DateTime<Utc>,
        outcome: IssueOutcome,
    },
}

impl LedgerEvent {
    pub fn issue_id(&self) -> &IssueId {
        match self {
            Self::IssueCreated { id, .. }
            | Self::AttemptStart { id, .. }
            | Self::AttemptFailed { id, .. }
            | Self::Pushed { id, .. }
            | Self::IssueFinished { id, .. } => id,
        }
    }
}

/// The `issue_created` fields of the newest issue.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerIssue {
    pub id: IssueId,
    pub title: String,
    pub source: String,
    pub sig: String,
    pub kind: IssueKind,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event under an exclusive file lock.
    pub fn append(&self, event: &LedgerEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let written = file.write_all(line.as_bytes());
        FileExt::unlock(&file)?;
        written?;
        Ok(())
    }

    /// Append, logging instead of failing.
    pub fn record(&self, event: &LedgerEvent) {
        if let Err(e) = self.append(event) {
            warn!("Failed to append to ledger {}: {}", self.path.display(), e);
        }
    }

    /// Every readable event, oldest first. Malformed lines are skipped.
    pub fn read_all(&self) -> Vec<LedgerEvent> {
        let Ok(text) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Newest `issue_created` entry.
    pub fn latest_issue(&self) -> Option<LedgerIssue> {
        self.read_all().into_iter().rev().find_map(|event| match event {
            LedgerEvent::IssueCreated {
                id,
                source,
                sig,
                kind,
                title,
                ..
            } => Some(LedgerIssue {
                id,
                title,
                source,
                sig,
                kind,
            }),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn created(id: &str) -> LedgerEvent {
        LedgerEvent::IssueCreated {
            id: id.into(),
            at: Utc::now(),
            source: "test".into(),
            sig: "abc".into(),
            kind: IssueKind::Runtime,
            title: format!("issue {id}"),
            rerun_of: None,
        }
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(LedgerEvent::AttemptFailed {
            id: "dh_1".into(),
            at: Utc::now(),
            attempt: 2,
            error: "patch does not apply".into(),
            kind: ErrorKind::NonApplyingPatch,
        })
        .unwrap();
        assert_eq!(json["event"], "attempt_failed");
        assert_eq!(json["kind"], "non_applying_patch");
        assert_eq!(json["attempt"], 2);
    }

    #[test]
    fn test_latest_issue_skips_malformed_lines() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::new(tmp.path().join("issues.jsonl"));
        ledger.append(&created("dh_1")).unwrap();
        ledger.append(&created("dh_2")).unwrap();
        ledger
            .append(&LedgerEvent::IssueFinished {
                id: "dh_2".into(),
                at: Utc::now(),
                outcome: IssueOutcome::Failed,
            })
            .unwrap();
        let mut f = OpenOptions::new().append(true).open(ledger.path()).unwrap();
        writeln!(f, "{{not json").unwrap();

        let latest = ledger.latest_issue().unwrap();
        assert_eq!(latest.id.as_str(), "dh_2");
        assert_eq!(ledger.read_all().len(), 3);
    }

    #[test]
    fn test_missing_ledger_is_empty() {
        let ledger = Ledger::new("/nonexistent/healer/issues.jsonl");
        assert!(ledger.read_all().is_empty());
        assert!(ledger.latest_issue().is_none());
    }
}
