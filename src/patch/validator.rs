//! Advisory check that every hunk's declared ranges match its body.
//!
//! The validator never blocks an apply; its findings are written to the fix
//! log when `git apply --check` fails so the next attempt has something
//! concrete to work with.

use super::hunk::{BodyLine, HunkHeader};

/// Declared versus observed counts for one hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkReport {
    /// 1-based line number of the `@@` header.
    pub line: usize,
    pub declared_old: u64,
    pub declared_new: u64,
    pub seen_old: u64,
    pub seen_new: u64,
}

impl HunkReport {
    pub fn is_consistent(&self) -> bool {
        self.declared_old == self.seen_old && self.declared_new == self.seen_new
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchValidation {
    pub ok: bool,
    pub hunks: Vec<HunkReport>,
    pub errors: Vec<String>,
}

/// Check each hunk header against the lines that follow it.
pub fn validate(patch: &str) -> PatchValidation {
    let lines: Vec<&str> = patch.lines().collect();
    let mut hunks = Vec::new();
    let mut errors = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if !line.starts_with("@@ ") {
            i += 1;
            continue;
        }

        let Some(header) = HunkHeader::parse_strict(line) else {
            errors.push(format!("bad hunk header at line {}", i + 1));
            i += 1;
            continue;
        };

        let (mut seen_old, mut seen_new) = (0u64, 0u64);
        let mut pending_blanks = 0u64;
        let mut j = i + 1;
        while j < lines.len() {
            let body = lines[j];
            if body.starts_with("@@ ") || body.starts_with("diff --git ") {
                break;
            }
            let kind = BodyLine::classify(body);
            if kind == BodyLine::Blank {
                pending_blanks += 1;
            } else {
                seen_old += pending_blanks;
                seen_new += pending_blanks;
                pending_blanks = 0;
                let (old, new) = kind.counts();
                seen_old += old;
                seen_new += new;
            }
            j += 1;
        }

        let report = HunkReport {
            line: i + 1,
            declared_old: header.old_count,
            declared_new: header.new_count,
            seen_old,
            seen_new,
        };
        if !report.is_consistent() {
            errors.push(format!(
                "hunk count mismatch near line {}: expected -{}/+{}, saw -{}/+{}",
                report.line,
                report.declared_old,
                report.declared_new,
                report.seen_old,
                report.seen_new
            ));
        }
        hunks.push(report);
        i = j;
    }

    PatchValidation {
        ok: errors.is_empty(),
        hunks,
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistent_patch_is_ok() {
        let patch = "diff --git a/x b/x\n--- a/x\n+++ b/x\n@@ -1,2 +1,2 @@\n a\n-b\n+c\n";
        let v = validate(patch);
        assert!(v.ok, "{:?}", v.errors);
        assert_eq!(v.hunks.len(), 1);
        assert_eq!(v.hunks[0].line, 4);
    }

    #[test]
    fn test_reports_count_mismatch() {
        let patch = "diff --git a/x b/x\n--- a/x\n+++ b/x\n@@ -10,3 +10,3 @@\n a\n b\n-c\n+d\n e\n";
        let v = validate(patch);
        assert!(!v.ok);
        assert_eq!(
            v.errors,
            vec!["hunk count mismatch near line 4: expected -3/+3, saw -4/+4".to_string()]
        );
    }

    #[test]
    fn test_bad_header() {
        let v = validate("@@ -x +1 @@\n a\n");
        assert!(!v.ok);
        assert_eq!(v.errors[0], "bad hunk header at line 1");
    }

    #[test]
    fn test_marker_lines_are_ignored() {
        let patch = "@@ -1 +1 @@\n-a\n\\ No newline at end of file\n+b\n\\ No newline at end of file\n";
        assert!(validate(patch).ok);
    }

    #[test]
    fn test_multiple_hunks_stop_at_next_header() {
        let patch = "@@ -1 +1 @@\n-a\n+b\n@@ -10,2 +10 @@\n x\n-y\ndiff --git a/z b/z\n";
        let v = validate(patch);
        assert!(v.ok, "{:?}", v.errors);
        assert_eq!(v.hunks.len(), 2);
    }

    #[test]
    fn test_trailing_newline_is_not_a_context_line() {
        let v = validate("@@ -1 +1 @@\n-a\n+b\n\n");
        assert!(v.ok, "{:?}", v.errors);
    }
}
