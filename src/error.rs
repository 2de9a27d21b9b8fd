//! Error types for the fix pipeline.
//!
//! Every stage reports failures through [`HealerError`]. The variants carry
//! enough text for the attempt controller to classify them and to feed the
//! failure detail back into the next attempt's prompt.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse failure category used by the ledger and the attempt controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthenticationRequired,
    MalformedPatch,
    NonApplyingPatch,
    PostFixCheckFailed,
    CommitOrPushFailed,
    NothingToCommit,
    WorktreeSetupFailed,
    ReintegrationFailed,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AuthenticationRequired => "authentication_required",
            Self::MalformedPatch => "malformed_patch",
            Self::NonApplyingPatch => "non_applying_patch",
            Self::PostFixCheckFailed => "post_fix_check_failed",
            Self::CommitOrPushFailed => "commit_or_push_failed",
            Self::NothingToCommit => "nothing_to_commit",
            Self::WorktreeSetupFailed => "worktree_setup_failed",
            Self::ReintegrationFailed => "reintegration_failed",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Main error type for healer operations
#[derive(Error, Debug)]
pub enum HealerError {
    // =========================================================================
    // Agent Errors
    // =========================================================================
    /// The patch agent reported that it needs an interactive login
    #[error("Authentication required: {detail}")]
    AuthenticationRequired { detail: String },

    /// The patch agent exited non-zero or produced no diff
    #[error("{message}")]
    PatchAgent { message: String },

    // =========================================================================
    // Patch Errors
    // =========================================================================
    /// git rejected the patch text as syntactically broken
    #[error("{message}")]
    MalformedPatch { message: String },

    /// The patch is well formed but does not apply to the worktree
    #[error("{message}")]
    NonApplyingPatch { message: String },

    // =========================================================================
    // Post-fix and Publish Errors
    // =========================================================================
    /// A post-fix verification command failed
    #[error("post-fix command failed: {command}\nexit: {code}{detail}")]
    PostFixCheckFailed {
        command: String,
        code: i32,
        detail: String,
    },

    /// A post-fix command is not on the allowlist
    #[error("post-fix command blocked by allowlist: {command}")]
    CommandNotAllowed { command: String },

    /// Commit or push failed
    #[error("{operation} failed: {message}")]
    CommitOrPushFailed { operation: String, message: String },

    /// The patch applied but left the worktree unchanged
    #[error("No changes detected after applying patch (nothing to commit).")]
    NothingToCommit,

    // =========================================================================
    // Workspace Errors
    // =========================================================================
    /// Worktree could not be created or reused
    #[error("Worktree setup failed for {path}: {message}")]
    WorktreeSetupFailed { path: PathBuf, message: String },

    /// Refused to touch a path outside the worktree root
    #[error("Refusing to remove path outside worktree root: {path}")]
    UnsafeWorktreePath { path: PathBuf },

    /// Reintegration into the main workspace failed
    #[error("Reintegration failed: {message}")]
    ReintegrationFailed { message: String },

    /// Another queue worker holds the workspace lock
    #[error("Queue is already running for this workspace (lock: {path})")]
    QueueBusy { path: PathBuf },

    /// Rerun could not find what it needs
    #[error("Nothing to rerun: {reason}")]
    NothingToRerun { reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Tool Errors
    // =========================================================================
    /// Git invocation could not be completed
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    /// Missing required tool
    #[error("Missing required tool: {tool}")]
    MissingTool { tool: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HealerError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a patch agent error
    pub fn agent(message: impl Into<String>) -> Self {
        Self::PatchAgent {
            message: message.into(),
        }
    }

    /// Create a worktree setup error
    pub fn worktree(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::WorktreeSetupFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a commit/push error
    pub fn publish(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommitOrPushFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Failure category of this error, independent of message text.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthenticationRequired { .. } => ErrorKind::AuthenticationRequired,
            Self::MalformedPatch { .. } => ErrorKind::MalformedPatch,
            Self::NonApplyingPatch { .. } => ErrorKind::NonApplyingPatch,
            Self::PostFixCheckFailed { .. } => ErrorKind::PostFixCheckFailed,
            Self::CommitOrPushFailed { .. } => ErrorKind::CommitOrPushFailed,
            Self::NothingToCommit => ErrorKind::NothingToCommit,
            Self::WorktreeSetupFailed { .. } | Self::UnsafeWorktreePath { .. } => {
                ErrorKind::WorktreeSetupFailed
            }
            Self::ReintegrationFailed { .. } => ErrorKind::ReintegrationFailed,
            _ => ErrorKind::Other,
        }
    }

    /// Check if another attempt can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }

    /// Check if this error must end the issue immediately
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationRequired { .. }
                | Self::NothingToCommit
                | Self::CommandNotAllowed { .. }
                | Self::WorktreeSetupFailed { .. }
                | Self::UnsafeWorktreePath { .. }
                | Self::QueueBusy { .. }
                | Self::Config { .. }
                | Self::InvalidConfig { .. }
                | Self::MissingTool { .. }
        )
    }

    /// Check if this error requires human intervention
    pub fn requires_human(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationRequired { .. } | Self::CommandNotAllowed { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AuthenticationRequired { .. } => 2,
            Self::NothingToCommit => 3,
            Self::CommandNotAllowed { .. } => 4,
            Self::QueueBusy { .. } => 5,
            Self::MissingTool { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for healer results
pub type Result<T> = std::result::Result<T, HealerError>;
