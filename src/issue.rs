//! Issues: the unit of work the pipeline fixes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of an issue: `dh_<base36 epoch millis>_<6 hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(String);

impl IssueId {
    /// Generate a fresh id for the given creation time.
    pub fn generate(at: DateTime<Utc>) -> Self {
        let millis = u64::try_from(at.timestamp_millis()).unwrap_or(0);
        let random = Uuid::new_v4().simple().to_string();
        Self(format!("dh_{}_{}", to_base36(millis), &random[..6]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IssueId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IssueId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase base-36 rendering of `n`.
pub fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Where the issue came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IssueKind {
    /// Captured runtime error or failed check.
    #[default]
    Runtime,
    /// Reported by a person describing a UI problem.
    ManualUi,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runtime => f.write_str("runtime"),
            Self::ManualUi => f.write_str("manual-ui"),
        }
    }
}

/// A problem to be fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: IssueId,
    pub title: String,
    pub source: String,
    pub signature: String,
    pub kind: IssueKind,
    /// Error excerpt the prompt is rebuilt from on every attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    /// Fully formed prompt, used when there is no excerpt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerun_of: Option<IssueId>,
    pub enqueued_at: DateTime<Utc>,
}

impl Issue {
    pub fn new(title: impl Into<String>, source: impl Into<String>, kind: IssueKind) -> Self {
        let now = Utc::now();
        Self {
            id: IssueId::generate(now),
            title: title.into(),
            source: source.into(),
            signature: String::new(),
            kind,
            excerpt: None,
            prompt_text: None,
            rerun_of: None,
            enqueued_at: now,
        }
    }

    /// Attach an excerpt; derives the signature if none is set yet.
    #[must_use]
    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        let excerpt = excerpt.into();
        if self.signature.is_empty() {
            self.signature = derive_signature(&excerpt);
        }
        self.excerpt = Some(excerpt);
        self
    }

    #[must_use]
    pub fn with_prompt_text(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        if self.signature.is_empty() {
            self.signature = derive_signature(&prompt);
        }
        self.prompt_text = Some(prompt);
        self
    }

    #[must_use]
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: IssueId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_rerun_of(mut self, id: IssueId) -> Self {
        self.rerun_of = Some(id);
        self
    }
}

/// Stable dedup key: first 16 hex chars of SHA-256 over the
/// whitespace-normalised text.
pub fn derive_signature(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Issue as submitted by a producer (one JSON object per line in `serve`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueSubmission {
    pub title: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub kind: IssueKind,
    #[serde(default)]
    pub excerpt: Option<String>,
    #[serde(default)]
    pub prompt_text: Option<String>,
}

fn default_source() -> String {
    "submission".to_string()
}

impl IssueSubmission {
    /// `None` when the submission has neither excerpt nor prompt text.
    pub fn into_issue(self) -> Option<Issue> {
        let mut issue = Issue::new(self.title, self.source, self.kind);
        if let Some(sig) = self.signature.filter(|s| !s.trim().is_empty()) {
            issue = issue.with_signature(sig);
        }
        match (self.excerpt, self.prompt_text) {
            (Some(excerpt), prompt) => {
                issue = issue.with_excerpt(excerpt);
                issue.prompt_text = prompt;
            }
            (None, Some(prompt)) => issue = issue.with_prompt_text(prompt),
            (None, None) => return None,
        }
        Some(issue)
    }
}
