//! Unified diff repair and validation.
//!
//! - [`sanitize`] turns near-miss model output into an appliable diff.
//! - [`validate`] reports hunk ranges that disagree with their bodies.

pub mod hunk;
pub mod sanitizer;
pub mod validator;

pub use hunk::HunkHeader;
pub use sanitizer::{sanitize, SanitizeStats, SanitizedPatch};
pub use validator::{validate, HunkReport, PatchValidation};
