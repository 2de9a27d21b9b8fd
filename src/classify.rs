//! Failure classification and next-attempt strategy.

use crate::error::{ErrorKind, HealerError};
use regex::Regex;
use std::fmt;

/// How the next attempt should differ from the failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAttemptStrategy {
    /// Stop retrying this issue.
    Abort,
    /// Plain non-streaming agent output plus malformed-output instructions.
    ForceNonStreaming,
    /// Quiet agent output plus smallest-possible-edit instructions.
    StrictMinimalEdit,
    /// Same settings; the failure detail is appended to the prompt.
    AppendFailureDetail,
}

impl fmt::Display for NextAttemptStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Abort => "abort",
            Self::ForceNonStreaming => "force non-streaming",
            Self::StrictMinimalEdit => "strict minimal edit",
            Self::AppendFailureDetail => "append failure detail",
        };
        f.write_str(s)
    }
}

/// Result of classifying a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub strategy: NextAttemptStrategy,
}

impl Classification {
    pub fn is_fatal(&self) -> bool {
        self.strategy == NextAttemptStrategy::Abort
    }
}

/// Classifies failure text with an ordered regex table.
pub struct FailureClassifier {
    /// Checked in order; the first match wins.
    patterns: Vec<(Regex, ErrorKind)>,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureClassifier {
    #[must_use]
    pub fn new() -> Self {
        // Ordered: authentication, malformed, non-applying.
        let patterns = vec![
            (r"(?i)authentication required", ErrorKind::AuthenticationRequired),
            (r"(?i)cursor-agent login", ErrorKind::AuthenticationRequired),
            (r"(?i)\bcursor\s+agent\s+login\b", ErrorKind::AuthenticationRequired),
            (r"(?i)corrupt patch", ErrorKind::MalformedPatch),
            (r"(?i)invalid hunk ranges", ErrorKind::MalformedPatch),
            (r"(?i)patch appears malformed", ErrorKind::MalformedPatch),
            (r"(?i)patch does not apply", ErrorKind::NonApplyingPatch),
            (r"(?i)already exists in working directory", ErrorKind::NonApplyingPatch),
            (r"(?i)patch failed:", ErrorKind::NonApplyingPatch),
        ];

        let compiled = patterns
            .into_iter()
            .filter_map(|(pattern, kind)| Regex::new(pattern).ok().map(|re| (re, kind)))
            .collect();

        Self { patterns: compiled }
    }

    /// Classify raw failure text.
    pub fn classify(&self, text: &str) -> Classification {
        let kind = self
            .patterns
            .iter()
            .find(|(re, _)| re.is_match(text))
            .map(|(_, kind)| *kind)
            .unwrap_or(ErrorKind::Other);
        Classification {
            kind,
            strategy: strategy_for(kind),
        }
    }

    /// Classify an error. Variants that are fatal regardless of their text
    /// abort; everything else is classified by message.
    pub fn classify_error(&self, error: &HealerError) -> Classification {
        let by_text = self.classify(&error.to_string());
        if by_text.kind == ErrorKind::AuthenticationRequired {
            return by_text;
        }
        if error.is_fatal() {
            return Classification {
                kind: error.kind(),
                strategy: NextAttemptStrategy::Abort,
            };
        }
        if by_text.kind == ErrorKind::Other {
            let kind = error.kind();
            return Classification {
                kind,
                strategy: strategy_for(kind),
            };
        }
        by_text
    }
}

fn strategy_for(kind: ErrorKind) -> NextAttemptStrategy {
    match kind {
        ErrorKind::AuthenticationRequired
        | ErrorKind::NothingToCommit
        | ErrorKind::WorktreeSetupFailed => NextAttemptStrategy::Abort,
        ErrorKind::MalformedPatch => NextAttemptStrategy::ForceNonStreaming,
        ErrorKind::NonApplyingPatch => NextAttemptStrategy::StrictMinimalEdit,
        _ => NextAttemptStrategy::AppendFailureDetail,
    }
}
