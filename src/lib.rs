//! Healer - automated fix pipeline
//!
//! Takes a detected issue (a runtime error excerpt or a stored prompt), asks
//! an external agent for a unified diff, and drives that diff through repair,
//! application, verification, commit and reintegration in an isolated git
//! worktree, retrying with a changed strategy when an attempt fails.
//!
//! # Architecture
//!
//! - [`patch`] - Unified diff sanitizer and hunk validator
//! - [`worktree`] - Per-issue git worktrees and retention
//! - [`agent`] - Patch agent subprocess, heartbeats, patch artifacts
//! - [`apply`] - `git apply --check` / `git apply` with diagnostics
//! - [`postfix`] - Allowlisted verification commands and the format guard
//! - [`commit`] - Commit and push
//! - [`reintegrate`] - Cherry-picking the fix back into the workspace
//! - [`controller`] - Bounded retry state machine
//! - [`pipeline`] - One issue end to end
//! - [`queue`] - Serial issue queue with human decisions
//! - [`testing`] - Mocks and fixtures
//!
//! # Example
//!
//! ```rust,ignore
//! use healer::{FixPipeline, GitCli, HealerConfig, PipelineContext};
//! use healer::agent::CommandPatchAgent;
//! use std::sync::Arc;
//!
//! let config = HealerConfig::load(root)?;
//! let agent = CommandPatchAgent::new(&config.agent, root, EventBus::default());
//! let ctx = PipelineContext::new(root, config, Arc::new(GitCli::new()), Arc::new(agent));
//! let report = FixPipeline::new(ctx)?.run_issue(&issue).await?;
//! ```

pub mod agent;
pub mod apply;
pub mod classify;
pub mod clock;
pub mod commit;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod fix_log;
pub mod git;
pub mod issue;
pub mod ledger;
pub mod patch;
pub mod pipeline;
pub mod postfix;
pub mod process;
pub mod prompt;
pub mod queue;
pub mod reintegrate;
pub mod rerun;
pub mod state;
pub mod testing;
pub mod worktree;

// Re-export commonly used types
pub use error::{ErrorKind, HealerError, Result};

pub use config::{HealerConfig, ReintegrationStrategy};
pub use git::{GitCli, GitRunner};
pub use issue::{Issue, IssueId, IssueKind, IssueSubmission};
pub use patch::{sanitize, validate, PatchValidation, SanitizedPatch};
pub use pipeline::{FixPipeline, PipelineContext, PipelineReport};
pub use queue::{HumanDecider, HumanDecision, IssueQueue, QueueHandle};

pub use testing::{MockClock, MockGit, MockPatchAgent};
