//! Agent prompt materialisation.
//!
//! A prompt has four parts, joined with blank lines:
//!
//! ```text
//! base prompt        rebuilt from the excerpt inside the worktree, or stored text
//! retry guidance     chosen by the attempt controller after a failure
//! repo snapshot      HEAD, status and file heads via `git show`
//! search hints       `git grep` results for identifiers in the prompt
//! ```
//!
//! # Example
//!
//! ```
//! use healer::prompt::{extract_search_terms, failure_addendum};
//!
//! let terms = extract_search_terms("TypeError in useCart: cartItems is undefined");
//! assert_eq!(terms, vec!["TypeError", "useCart", "cartItems"]);
//!
//! let text = failure_addendum("error: patch failed: src/a.ts:3", None);
//! assert!(text.contains(">> error: patch failed: src/a.ts:3"));
//! ```

use crate::git::GitRunner;
use crate::issue::{Issue, IssueKind};
use crate::process::head_chars;
use crate::state::is_strictly_under;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::debug;

const MAX_LINE_REFS: usize = 6;
const MAX_OTHER_PATHS: usize = 6;
const REF_CONTEXT_LINES: usize = 70;
const REF_MAX_BYTES: usize = 18_000;
const OTHER_MAX_BYTES: usize = 10_000;
const WHOLE_FILE_LINES: usize = 220;
const MAX_FILE_BYTES: u64 = 512_000;

const SNAPSHOT_STATUS_ENTRIES: usize = 12;
const SNAPSHOT_MAX_FILES: usize = 6;
const SNAPSHOT_HEAD_LINES: usize = 140;

const MAX_SEARCH_TERMS: usize = 5;
const GREP_OUTPUT_LINES: usize = 6;

/// Fix log lines quoted back to the agent after a failed post-fix command.
pub const FAILURE_LOG_TAIL_LINES: usize = 220;

const STOP_WORDS: &[&str] = &[
    "diff", "git", "index", "import", "export", "default", "return", "const", "let", "var",
    "function", "class", "interface", "type", "extends", "implements", "async", "await", "true",
    "false", "null", "undefined", "string", "number", "boolean", "props", "state", "react",
    "node", "error", "errors", "runtime", "issue", "prompt", "context", "repo", "playbook",
];

const EXTENSIONS: &str = "ts|tsx|js|jsx|mjs|cjs|css|scss|md|vue|svelte|rs|py|go";

fn line_ref_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"((?:/[^:\s]+/)?src/[A-Za-z0-9_./-]+\.(?:{EXTENSIONS})):(\d+)(?::\d+)?"
        ))
        .unwrap_or_else(|e| panic!("invalid line ref pattern: {e}"))
    })
}

fn repo_path_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"(src/[A-Za-z0-9_./-]+\.(?:{EXTENSIONS}))"))
            .unwrap_or_else(|e| panic!("invalid repo path pattern: {e}"))
    })
}

fn excerpt_header_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?m)^---\s+(src/[A-Za-z0-9_./-]+\.(?:{EXTENSIONS}))\s+\(L\d+-L\d+\)\s+---\s*$"
        ))
        .unwrap_or_else(|e| panic!("invalid excerpt header pattern: {e}"))
    })
}

fn identifier_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]{2,}\b")
            .unwrap_or_else(|e| panic!("invalid identifier pattern: {e}"))
    })
}

/// A `path:line` reference found in an excerpt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRef {
    pub path: String,
    pub line: usize,
}

/// `src/...:line` references, absolute paths cut back to `src/`.
pub fn extract_line_refs(text: &str) -> Vec<LineRef> {
    line_ref_pattern()
        .captures_iter(text)
        .filter_map(|caps| {
            let raw = caps.get(1)?.as_str();
            let path = raw.find("src/").map_or(raw, |i| &raw[i..]);
            let line = caps.get(2)?.as_str().parse().ok()?;
            Some(LineRef {
                path: path.to_string(),
                line,
            })
        })
        .take(MAX_LINE_REFS)
        .collect()
}

fn extract_repo_paths(text: &str, limit: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in repo_path_pattern().find_iter(text) {
        let p = m.as_str().to_string();
        if !out.contains(&p) {
            out.push(p);
            if out.len() >= limit {
                break;
            }
        }
    }
    out
}

/// Paths whose contents the prompt already shows, falling back to any
/// mentioned path.
pub fn extract_context_paths(prompt: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for caps in excerpt_header_pattern().captures_iter(prompt) {
        if let Some(m) = caps.get(1) {
            let p = m.as_str().to_string();
            if !out.contains(&p) {
                out.push(p);
            }
        }
        if out.len() >= SNAPSHOT_MAX_FILES {
            break;
        }
    }
    if out.is_empty() {
        out = extract_repo_paths(prompt, SNAPSHOT_MAX_FILES);
    }
    out
}

/// High-signal identifiers: PascalCase, camelCase, `useX` hooks, or
/// containing `_`. Stop words are skipped.
pub fn extract_search_terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut terms = Vec::new();
    for m in identifier_pattern().find_iter(text) {
        let t = m.as_str();
        if STOP_WORDS.contains(&t.to_lowercase().as_str()) {
            continue;
        }
        if !is_high_signal(t) || !seen.insert(t.to_string()) {
            continue;
        }
        terms.push(t.to_string());
        if terms.len() >= MAX_SEARCH_TERMS {
            break;
        }
    }
    terms
}

fn is_high_signal(t: &str) -> bool {
    let bytes = t.as_bytes();
    let pascal = bytes[0].is_ascii_uppercase()
        && t.chars().all(|c| c.is_ascii_alphanumeric())
        && t.chars().any(|c| c.is_ascii_lowercase());
    let hook = t.starts_with("use") && bytes.get(3).is_some_and(u8::is_ascii_uppercase);
    let camel = bytes
        .windows(2)
        .any(|w| w[0].is_ascii_lowercase() && w[1].is_ascii_uppercase());
    pascal || hook || camel || t.contains('_')
}

/// Read a slice of `rel` under `root` formatted as a prompt excerpt.
fn read_file_excerpt(root: &Path, rel: &str, around: Option<usize>, max_bytes: usize) -> Option<String> {
    let abs = root.join(rel);
    if !is_strictly_under(root, &abs) {
        return None;
    }
    let meta = std::fs::metadata(&abs).ok()?;
    if !meta.is_file() {
        return None;
    }
    if meta.len() > MAX_FILE_BYTES {
        return Some(format!(
            "[file omitted: {rel} (too large: {} bytes)]",
            meta.len()
        ));
    }
    let text = std::fs::read_to_string(&abs).ok()?;
    let lines: Vec<&str> = text.split('\n').collect();
    let (start, end) = match around {
        Some(line) if line > 0 && !lines.is_empty() => {
            let idx = (line - 1).min(lines.len() - 1);
            (
                idx.saturating_sub(REF_CONTEXT_LINES),
                (idx + REF_CONTEXT_LINES + 1).min(lines.len()),
            )
        }
        _ => (0, lines.len().min(WHOLE_FILE_LINES)),
    };
    let body = lines[start..end].join("\n");
    let body = if body.len() > max_bytes {
        format!("{}\n/* ...truncated... */\n", head_chars(&body, max_bytes))
    } else {
        body
    };
    Some(format!("--- {rel} (L{}-L{end}) ---\n{body}", start + 1))
}

fn context_block(excerpt: &str, root: &Path) -> String {
    let mut blocks = Vec::new();
    let refs = extract_line_refs(excerpt);
    for r in &refs {
        if let Some(block) = read_file_excerpt(root, &r.path, Some(r.line), REF_MAX_BYTES) {
            blocks.push(block);
        }
    }
    for p in extract_repo_paths(excerpt, MAX_OTHER_PATHS) {
        if refs.iter().any(|r| r.path == p) {
            continue;
        }
        if let Some(block) = read_file_excerpt(root, &p, None, OTHER_MAX_BYTES) {
            blocks.push(block);
        }
    }
    if blocks.is_empty() {
        return String::new();
    }
    ["Context (read-only file excerpts):".to_string(), blocks.join("\n\n"), String::new()].join("\n")
}

/// Repair prompt for an excerpt, with file excerpts read from `root`.
pub fn build_fix_prompt(excerpt: &str, kind: IssueKind, root: &Path) -> String {
    let (goal, label) = match kind {
        IssueKind::Runtime => (
            "Goal: fix the runtime error(s) shown below with minimal changes so the dev server recovers.",
            "Runtime error excerpt:",
        ),
        IssueKind::ManualUi => (
            "Goal: implement the requested UI/UX behavior described below.",
            "UI issue report:",
        ),
    };
    [
        "You are a code repair agent.",
        goal,
        "",
        "Constraints:",
        "- Output ONLY a unified diff (git format) starting with `diff --git`.",
        "- No markdown fences and no explanation outside the diff.",
        "- Do NOT modify lockfiles.",
        "- Prefer targeted edits; do NOT rewrite entire files.",
        "- Keep the diff small and localized; preserve behavior outside the fix.",
        "- Do not fix external auth/CORS/network errors unless the change is directly about them.",
        "",
        &context_block(excerpt, root),
        label,
        excerpt,
        "",
    ]
    .join("\n")
}

/// Instructions appended after a patch that did not apply.
pub fn strict_minimal_addendum() -> &'static str {
    "IMPORTANT: Your previous output did not produce an applyable patch for the current files.\n\
     You likely used a stale or incorrect snippet, or proposed a too-large rewrite.\n\
     \n\
     Rules for the next attempt:\n\
     - Make the smallest possible targeted edits. NO large refactors.\n\
     - Do NOT rewrite entire files.\n\
     - Do NOT add files that already exist; if a file exists, modify it instead.\n\
     - Output ONLY a valid unified diff starting with `diff --git`.\n"
}

/// Instructions appended after malformed agent output.
pub fn malformed_addendum() -> &'static str {
    "IMPORTANT: Your previous output was malformed and could not be applied as a patch.\n\
     You MUST output a single valid unified diff starting with `diff --git`.\n\
     Every hunk header must match the number of lines in its hunk, and every\n\
     context line must start with a single space.\n"
}

/// Failure detail for the next attempt, each line prefixed with `>> `.
pub fn failure_addendum(message: &str, log_tail: Option<&str>) -> String {
    let mut lines = vec![
        "Previous attempt failed. You MUST output a new unified diff that applies cleanly and makes all checks/commit/push succeed.".to_string(),
        "Failure details:".to_string(),
    ];
    lines.extend(message.lines().map(|l| format!(">> {l}")));
    if let Some(tail) = log_tail.filter(|t| !t.trim().is_empty()) {
        lines.push(String::new());
        lines.push("Last attempt fix log excerpt (tail):".to_string());
        lines.extend(
            tail.lines()
                .take(FAILURE_LOG_TAIL_LINES + 20)
                .map(|l| format!(">> {l}")),
        );
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Builds the per-attempt prompt blocks that need git.
pub struct PromptBuilder {
    git: Arc<dyn GitRunner>,
}

impl PromptBuilder {
    pub fn new(git: Arc<dyn GitRunner>) -> Self {
        Self { git }
    }

    /// The issue's prompt before retry guidance.
    ///
    /// Issues with an excerpt get a fresh repair prompt built against `cwd`
    /// so the excerpts match the files the agent will patch.
    pub fn base_prompt(issue: &Issue, cwd: &Path) -> String {
        match (&issue.excerpt, &issue.prompt_text) {
            (Some(excerpt), _) if !excerpt.trim().is_empty() => {
                build_fix_prompt(excerpt, issue.kind, cwd)
            }
            (_, Some(prompt)) => prompt.clone(),
            (Some(excerpt), None) => build_fix_prompt(excerpt, issue.kind, cwd),
            (None, None) => String::new(),
        }
    }

    /// Read-only snapshot of the worktree for the prompt. Empty on failure.
    pub async fn repo_snapshot(&self, cwd: &Path, prompt: &str, base_ref: &str) -> String {
        let mut lines = vec![
            "Repo snapshot (read-only; use this to ensure your diff applies cleanly):".to_string(),
        ];
        if !base_ref.trim().is_empty() {
            lines.push(format!("- baseRef: {}", base_ref.trim()));
        }
        if let Ok(head) = self.git.run(cwd, &["rev-parse", "HEAD"], None).await {
            if head.success() {
                lines.push(format!("- worktree HEAD: {}", head.stdout_trimmed()));
            }
        }
        if let Ok(status) = self.git.run(cwd, &["status", "--porcelain"], None).await {
            if status.success() {
                let entries: Vec<&str> = status
                    .stdout
                    .trim()
                    .lines()
                    .take(SNAPSHOT_STATUS_ENTRIES)
                    .collect();
                let summary = if entries.is_empty() {
                    "(clean)".to_string()
                } else {
                    entries.join(" | ")
                };
                lines.push(format!("- git status --porcelain: {summary}"));
            }
        }

        let files = extract_context_paths(prompt);
        if !files.is_empty() {
            lines.push(String::new());
            lines.push("File excerpts from HEAD (via `git show`):".to_string());
        }
        for path in files {
            let rev = format!("HEAD:{path}");
            match self.git.run(cwd, &["show", &rev], None).await {
                Ok(show) if show.success() => {
                    let body = head_chars(&show.stdout, REF_MAX_BYTES);
                    let head: Vec<&str> = body.split('\n').take(SNAPSHOT_HEAD_LINES).collect();
                    lines.push(format!("--- {path} (HEAD, first {SNAPSHOT_HEAD_LINES} lines) ---"));
                    lines.push(head.join("\n"));
                }
                _ => lines.push(format!(
                    "--- {path} (git show failed; file may be new/untracked) ---"
                )),
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }

    /// `git grep` results for identifiers in the prompt. Empty when nothing
    /// matched.
    pub async fn search_hints(&self, cwd: &Path, prompt: &str) -> String {
        let terms = extract_search_terms(prompt);
        if terms.is_empty() {
            return String::new();
        }
        let mut lines = vec![
            "Repo search hints (via `git grep`):".to_string(),
            "(Use these to anchor edits in the real code instead of rewriting files.)".to_string(),
            String::new(),
        ];
        let mut found = false;
        for term in &terms {
            let Ok(out) = self
                .git
                .run(cwd, &["grep", "-n", "-m", "3", term, "--", "src"], None)
                .await
            else {
                continue;
            };
            if !out.success() || out.stdout.trim().is_empty() {
                continue;
            }
            found = true;
            lines.push(format!("--- git grep -n -m 3 \"{term}\" -- src ---"));
            lines.extend(
                out.stdout
                    .trim()
                    .lines()
                    .take(GREP_OUTPUT_LINES)
                    .map(str::to_string),
            );
            lines.push(String::new());
        }
        if !found {
            debug!("No git grep hits for {} term(s)", terms.len());
            return String::new();
        }
        format!("{}\n", lines.join("\n").trim())
    }
}

/// Join non-empty prompt parts with blank lines.
pub fn join_prompt_parts(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_end_matches('\n'))
        .filter(|p| !p.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use crate::testing::MockGit;
    use tempfile::TempDir;

    #[test]
    fn test_line_refs_strip_absolute_prefix() {
        let refs = extract_line_refs(
            "at /home/dev/app/src/cart/useCart.ts:42:7\nat src/App.tsx:10",
        );
        assert_eq!(
            refs,
            vec![
                LineRef {
                    path: "src/cart/useCart.ts".into(),
                    line: 42
                },
                LineRef {
                    path: "src/App.tsx".into(),
                    line: 10
                },
            ]
        );
    }

    #[test]
    fn test_search_terms_skip_stop_words_and_plain_words() {
        let terms = extract_search_terms(
            "Error: Cannot read cartItems of undefined in CartDrawer via useCart and MAX_ITEMS. React React",
        );
        assert_eq!(terms, vec!["Cannot", "cartItems", "CartDrawer", "useCart", "MAX_ITEMS"]);
    }

    #[test]
    fn test_fix_prompt_includes_excerpt_around_line() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        let body: Vec<String> = (1..=300).map(|i| format!("line {i}")).collect();
        std::fs::write(tmp.path().join("src/big.ts"), body.join("\n")).unwrap();

        let prompt = build_fix_prompt("boom at src/big.ts:200:3", IssueKind::Runtime, tmp.path());
        assert!(prompt.contains("--- src/big.ts (L130-L270) ---"));
        assert!(prompt.contains("line 200"));
        assert!(!prompt.contains("line 129\n"));
        assert!(prompt.contains("Runtime error excerpt:\nboom at src/big.ts:200:3"));
    }

    #[test]
    fn test_base_prompt_prefers_excerpt() {
        let tmp = TempDir::new().unwrap();
        let issue = Issue::new("t", "s", IssueKind::ManualUi).with_prompt_text("stored");
        assert_eq!(PromptBuilder::base_prompt(&issue, tmp.path()), "stored");
        let issue = issue.with_excerpt("button misaligned");
        let prompt = PromptBuilder::base_prompt(&issue, tmp.path());
        assert!(prompt.contains("UI issue report:\nbutton misaligned"));
    }

    #[test]
    fn test_failure_addendum_quotes_log_tail() {
        let text = failure_addendum(
            "post-fix command failed: npm test\nexit: 1",
            Some("FAIL src/a.test.ts\n  expected 1"),
        );
        assert!(text.contains(">> post-fix command failed: npm test\n>> exit: 1"));
        assert!(text.contains("Last attempt fix log excerpt (tail):\n>> FAIL src/a.test.ts"));
    }

    #[tokio::test]
    async fn test_repo_snapshot_lists_head_files() {
        let git = Arc::new(
            MockGit::new()
                .with_response(&["rev-parse", "HEAD"], CommandOutput::ok("abc\n"))
                .with_response(&["status", "--porcelain"], CommandOutput::ok(""))
                .with_response(&["show", "HEAD:src/a.ts"], CommandOutput::ok("export const a = 1;\n"))
                .with_response(&["show", "HEAD:src/new.ts"], CommandOutput::failed(128, "")),
        );
        let builder = PromptBuilder::new(git);
        let prompt = "--- src/a.ts (L1-L2) ---\n...\n--- src/new.ts (L1-L1) ---\n";
        let snapshot = builder.repo_snapshot(Path::new("/wt"), prompt, "base123").await;
        assert!(snapshot.contains("- baseRef: base123"));
        assert!(snapshot.contains("- worktree HEAD: abc"));
        assert!(snapshot.contains("- git status --porcelain: (clean)"));
        assert!(snapshot.contains("--- src/a.ts (HEAD, first 140 lines) ---\nexport const a = 1;"));
        assert!(snapshot.contains("--- src/new.ts (git show failed"));
    }

    #[tokio::test]
    async fn test_search_hints_empty_without_hits() {
        let git = Arc::new(MockGit::new().with_response(&["grep"], CommandOutput::failed(1, "")));
        let builder = PromptBuilder::new(git.clone());
        assert_eq!(builder.search_hints(Path::new("/wt"), "useCart broke").await, "");
        assert!(git.was_called(&["grep", "-n", "-m", "3", "useCart", "--", "src"]));
    }

    #[test]
    fn test_join_prompt_parts_skips_empty() {
        assert_eq!(join_prompt_parts(&["a\n", "", "b"]), "a\n\nb");
    }
}
