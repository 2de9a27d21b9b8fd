//! Applying a patch to a worktree.
//!
//! `git apply --check` runs first; when it fails the error carries a
//! diagnostics block (HEAD, status, and the current head of every file git
//! complained about) so the next attempt sees the real file contents.

use crate::agent::PatchArtifact;
use crate::classify::FailureClassifier;
use crate::error::{ErrorKind, HealerError, Result};
use crate::fix_log::{FixLog, LineWriter};
use crate::git::GitRunner;
use crate::process::head_chars;
use crate::state::is_strictly_under;
use regex::Regex;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

const MAX_DIAGNOSED_PATHS: usize = 5;
const FILE_HEAD_LINES: usize = 80;
const FILE_HEAD_CHARS: usize = 6000;
const STATUS_ENTRIES: usize = 8;
const OUTPUT_TAIL_CHARS: usize = 4000;

fn path_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"patch failed:\s+([^:\n]+):\d+",
            r"error:\s+([^:\n]+):\s+patch does not apply",
            r"error:\s+([^:\n]+):\s+already exists in working directory",
        ]
        .into_iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Paths named in `git apply` error output, in first-seen order.
pub fn implicated_paths(output: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for re in path_patterns() {
        for caps in re.captures_iter(output) {
            if let Some(m) = caps.get(1) {
                let p = m.as_str().trim().to_string();
                if !p.is_empty() && !paths.contains(&p) {
                    paths.push(p);
                }
            }
        }
    }
    paths
}

/// State of one implicated file in the worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiagnostic {
    pub path: String,
    pub exists: bool,
    pub tracked: Option<bool>,
    pub head: Option<String>,
}

/// Worktree context captured when a patch does not apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyDiagnostics {
    pub head: String,
    pub status: String,
    pub files: Vec<FileDiagnostic>,
}

impl ApplyDiagnostics {
    pub fn render(&self) -> String {
        let mut out = String::from("--- Apply Diagnostics ---\n");
        let _ = writeln!(out, "HEAD: {}", self.head);
        let _ = writeln!(out, "Status: {}", self.status);
        for file in &self.files {
            let tracked = match file.tracked {
                Some(true) => "yes",
                Some(false) => "no",
                None => "unknown",
            };
            let _ = writeln!(
                out,
                "\nFile: {} (exists: {}, tracked: {})",
                file.path,
                if file.exists { "yes" } else { "no" },
                tracked
            );
            if let Some(head) = &file.head {
                let _ = writeln!(
                    out,
                    "Current content (first {FILE_HEAD_LINES} lines):\n{head}"
                );
            }
        }
        out
    }
}

pub struct PatchApplier {
    git: Arc<dyn GitRunner>,
    classifier: FailureClassifier,
}

impl PatchApplier {
    pub fn new(git: Arc<dyn GitRunner>) -> Self {
        Self {
            git,
            classifier: FailureClassifier::new(),
        }
    }

    /// Check and apply `artifact` in `cwd`.
    pub async fn apply(&self, cwd: &Path, artifact: &PatchArtifact, log: &FixLog) -> Result<()> {
        let patch = artifact.patch();
        log.line("[apply] git apply --check");
        let check = self
            .git
            .run(
                cwd,
                &["apply", "--check", "--whitespace=nowarn", "-"],
                Some(patch),
            )
            .await?;
        {
            let mut stderr = LineWriter::new(log, "[git] ");
            stderr.write(&check.stderr);
        }

        if !check.success() {
            if artifact.sanitized.changed {
                log.line(format!(
                    "[warn] patch was sanitized before apply: {}",
                    artifact.sanitized.summary()
                ));
            }
            if !artifact.validation.ok {
                for err in &artifact.validation.errors {
                    log.line(format!("[warn] {err}"));
                }
            }
            let combined = format!("{}\n{}", check.stderr, check.stdout);
            let diagnostics = self.collect_diagnostics(cwd, &combined).await;
            let rendered = diagnostics.render();
            log.line(&rendered);
            warn!("git apply --check failed (code {})", check.code);

            let message = format!(
                "git apply --check failed: code {}{}\n\n{}",
                check.code,
                check.describe_tails(OUTPUT_TAIL_CHARS),
                rendered
            );
            return Err(match self.classifier.classify(&combined).kind {
                ErrorKind::MalformedPatch => HealerError::MalformedPatch { message },
                _ => HealerError::NonApplyingPatch { message },
            });
        }

        let applied = self
            .git
            .run(cwd, &["apply", "--whitespace=nowarn", "-"], Some(patch))
            .await?;
        {
            let mut stderr = LineWriter::new(log, "[git] ");
            stderr.write(&applied.stderr);
        }
        if !applied.success() {
            return Err(HealerError::NonApplyingPatch {
                message: format!(
                    "git apply failed: code {}{}",
                    applied.code,
                    applied.describe_tails(OUTPUT_TAIL_CHARS)
                ),
            });
        }
        log.line("[apply] patch applied");
        info!("Patch applied in {}", cwd.display());
        Ok(())
    }

    /// Capture HEAD, status, and the files named in `apply_output`.
    pub async fn collect_diagnostics(&self, cwd: &Path, apply_output: &str) -> ApplyDiagnostics {
        let head = match self.git.run(cwd, &["rev-parse", "HEAD"], None).await {
            Ok(out) if out.success() => out.stdout_trimmed().to_string(),
            _ => "(unknown)".to_string(),
        };
        let status = match self.git.run(cwd, &["status", "--porcelain"], None).await {
            Ok(out) if out.success() => {
                let entries: Vec<&str> = out
                    .stdout
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .take(STATUS_ENTRIES)
                    .collect();
                if entries.is_empty() {
                    "(clean)".to_string()
                } else {
                    entries.join(" | ")
                }
            }
            _ => "(unknown)".to_string(),
        };

        let mut files = Vec::new();
        for rel in implicated_paths(apply_output)
            .into_iter()
            .take(MAX_DIAGNOSED_PATHS)
        {
            let full = cwd.join(&rel);
            if !is_strictly_under(cwd, &full) {
                continue;
            }
            let exists = full.is_file();
            let tracked = match self
                .git
                .run(cwd, &["ls-files", "--error-unmatch", "--", &rel], None)
                .await
            {
                Ok(out) => Some(out.success()),
                Err(_) => None,
            };
            let head = if exists {
                std::fs::read_to_string(&full).ok().map(|text| {
                    let lines: Vec<&str> = text.lines().take(FILE_HEAD_LINES).collect();
                    head_chars(&lines.join("\n"), FILE_HEAD_CHARS).to_string()
                })
            } else {
                None
            };
            files.push(FileDiagnostic {
                path: rel,
                exists,
                tracked,
                head,
            });
        }

        ApplyDiagnostics {
            head,
            status,
            files,
        }
    }
}
