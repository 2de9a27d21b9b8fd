//! Testing infrastructure for the fix pipeline.
//!
//! - **Mocks**: doubles for [`GitRunner`](crate::git::GitRunner),
//!   [`PatchAgent`](crate::agent::PatchAgent) and [`Clock`](crate::clock::Clock)
//! - **Fixtures**: throwaway git repositories (test-only)
//!
//! # Example
//!
//! ```rust,ignore
//! use healer::testing::{MockGit, MockPatchAgent};
//!
//! let git = MockGit::new().with_response(&["status", "--porcelain"], CommandOutput::ok(""));
//! let agent = MockPatchAgent::new().with_diff("diff --git a/x b/x\n");
//! ```

#[cfg(test)]
pub mod fixtures;
pub mod mocks;

#[cfg(test)]
pub use fixtures::*;
pub use mocks::*;
