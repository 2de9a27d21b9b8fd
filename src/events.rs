//! Progress events for UI consumers.

use crate::error::ErrorKind;
use crate::issue::IssueId;
use std::fmt;
use tokio::sync::broadcast;

/// Pipeline stage within one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Worktree,
    Agent,
    Apply,
    PostFix,
    Commit,
    Reintegrate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Worktree => "preparing worktree",
            Self::Agent => "generating patch",
            Self::Apply => "applying patch",
            Self::PostFix => "running post-fix checks",
            Self::Commit => "committing",
            Self::Reintegrate => "reintegrating",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Queued {
        id: IssueId,
        title: String,
    },
    AttemptStarted {
        id: IssueId,
        attempt: u32,
        max_attempts: u32,
    },
    Stage {
        id: IssueId,
        stage: Stage,
    },
    Heartbeat {
        id: IssueId,
        elapsed_secs: u64,
        quiet_secs: u64,
    },
    AttemptFailed {
        id: IssueId,
        attempt: u32,
        kind: ErrorKind,
        message: String,
    },
    Succeeded {
        id: IssueId,
        sha: Option<String>,
    },
    Failed {
        id: IssueId,
        message: String,
    },
    Paused {
        resume_in_ms: u64,
    },
    Resumed,
}

/// Broadcast channel for [`PipelineEvent`]s. Sending never fails; events
/// without subscribers are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }
}
