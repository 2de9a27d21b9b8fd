//! Repair of LLM-produced unified diffs.
//!
//! The agent's output is usually *almost* a valid git diff: prose before the
//! first `diff --git`, context lines that lost their leading space, hunk
//! headers indented by one column, and `@@` ranges that no longer match the
//! body. [`sanitize`] fixes exactly those defects and nothing else, and is
//! idempotent: feeding its output back in yields the same text.

use super::hunk::{is_diff_header_line, BodyLine, HunkHeader};

/// Counters describing what the sanitizer changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizeStats {
    pub fixed_missing_prefixes: usize,
    pub fixed_hunk_headers: usize,
    pub fixed_hunk_ranges: usize,
    pub dropped_non_diff_lines: usize,
}

impl SanitizeStats {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Result of [`sanitize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedPatch {
    pub patch: String,
    pub changed: bool,
    pub stats: SanitizeStats,
}

impl SanitizedPatch {
    pub fn has_git_diff(&self) -> bool {
        self.patch.contains("diff --git ")
    }

    /// One-line summary for the fix log.
    pub fn summary(&self) -> String {
        format!(
            "fixedMissingPrefixes={} fixedHunkHeaders={} fixedHunkRanges={} droppedNonDiffLines={}",
            self.stats.fixed_missing_prefixes,
            self.stats.fixed_hunk_headers,
            self.stats.fixed_hunk_ranges,
            self.stats.dropped_non_diff_lines
        )
    }
}

struct OpenHunk {
    header_index: usize,
    old_seen: u64,
    new_seen: u64,
    /// Blank lines not yet known to be interior context.
    pending_blanks: usize,
}

struct Sanitizer {
    out: Vec<String>,
    stats: SanitizeStats,
    hunk: Option<OpenHunk>,
}

impl Sanitizer {
    fn new() -> Self {
        Self {
            out: Vec::new(),
            stats: SanitizeStats::default(),
            hunk: None,
        }
    }

    /// Close the open hunk, rewriting its header if the body disagrees.
    ///
    /// Blank lines still pending at this point trail the hunk body. They are
    /// dropped: not emitted, and not counted toward the rewritten header.
    fn finalize_hunk(&mut self) {
        let Some(hunk) = self.hunk.take() else {
            return;
        };
        let Some(line) = self.out.get(hunk.header_index) else {
            return;
        };
        let Some(header) = HunkHeader::parse(line) else {
            return;
        };
        if header.old_count != hunk.old_seen || header.new_count != hunk.new_seen {
            self.out[hunk.header_index] = header.with_counts(hunk.old_seen, hunk.new_seen).to_string();
            self.stats.fixed_hunk_ranges += 1;
        }
    }

    fn open_hunk(&mut self, header: String) {
        self.finalize_hunk();
        self.hunk = Some(OpenHunk {
            header_index: self.out.len(),
            old_seen: 0,
            new_seen: 0,
            pending_blanks: 0,
        });
        self.out.push(header);
    }

    fn push_body(&mut self, line: &str) {
        let Some(hunk) = self.hunk.as_mut() else {
            return;
        };
        let kind = BodyLine::classify(line);
        if kind == BodyLine::Blank {
            hunk.pending_blanks += 1;
            return;
        }

        // Blank lines followed by more body are empty context lines.
        for _ in 0..hunk.pending_blanks {
            self.out.push(" ".to_string());
            hunk.old_seen += 1;
            hunk.new_seen += 1;
            self.stats.fixed_missing_prefixes += 1;
        }
        hunk.pending_blanks = 0;

        let (old, new) = kind.counts();
        hunk.old_seen += old;
        hunk.new_seen += new;
        if kind == BodyLine::Unprefixed {
            self.out.push(format!(" {line}"));
            self.stats.fixed_missing_prefixes += 1;
        } else {
            self.out.push(line.to_string());
        }
    }

    fn feed(&mut self, line: &str) {
        if line.starts_with("diff --git ") {
            self.finalize_hunk();
            self.out.push(line.to_string());
            return;
        }
        if line.starts_with("@@ ") {
            self.open_hunk(line.to_string());
            return;
        }
        if line.starts_with("```") {
            // Markdown fence around the diff.
            self.finalize_hunk();
            self.stats.dropped_non_diff_lines += 1;
            return;
        }
        if line.starts_with(char::is_whitespace) {
            let trimmed = line.trim_start();
            if trimmed.starts_with("@@ ") && HunkHeader::parse(trimmed).is_some() {
                self.stats.fixed_hunk_headers += 1;
                self.open_hunk(trimmed.to_string());
                return;
            }
        }

        if self.hunk.is_some() {
            self.push_body(line);
        } else if line.is_empty() || is_diff_header_line(line) {
            self.out.push(line.to_string());
        } else {
            self.stats.dropped_non_diff_lines += 1;
        }
    }

    fn finish(mut self, raw: &str) -> SanitizedPatch {
        self.finalize_hunk();
        let joined = self.out.join("\n");
        let body = joined.trim_end_matches('\n');
        let patch = if body.is_empty() {
            String::new()
        } else {
            format!("{body}\n")
        };
        SanitizedPatch {
            changed: patch != raw,
            patch,
            stats: self.stats,
        }
    }
}

/// Repair a unified diff produced by a language model.
///
/// Everything before the first `diff --git` line is dropped. Hunk bodies keep
/// their content; only missing context prefixes and header ranges change.
pub fn sanitize(raw: &str) -> SanitizedPatch {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut sanitizer = Sanitizer::new();
    let mut started = false;

    for line in normalized.split('\n') {
        if !started {
            if !line.starts_with("diff --git ") {
                continue;
            }
            started = true;
        }
        sanitizer.feed(line);
    }

    sanitizer.finish(raw)
}
