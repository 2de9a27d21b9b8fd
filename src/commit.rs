//! Committing and pushing a fix.

use crate::error::{HealerError, Result};
use crate::fix_log::FixLog;
use crate::git::GitRunner;
use crate::issue::Issue;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const TEMPLATE_FIELD_MAX_CHARS: usize = 140;

/// A commit created for an issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub committed_sha: String,
    pub pushed: bool,
}

/// Fill `{id}`, `{title}` and `{sig}` in a commit message template.
pub fn format_commit_message(template: &str, issue: &Issue) -> String {
    let truncate = |s: &str| -> String { s.chars().take(TEMPLATE_FIELD_MAX_CHARS).collect() };
    template
        .replace("{id}", issue.id.as_str())
        .replace("{title}", &truncate(&issue.title))
        .replace("{sig}", &truncate(&issue.signature))
}

pub struct CommitPublisher {
    git: Arc<dyn GitRunner>,
    auto_commit: bool,
    auto_push: bool,
    remote: String,
    template: String,
}

impl CommitPublisher {
    pub fn new(
        git: Arc<dyn GitRunner>,
        auto_commit: bool,
        auto_push: bool,
        remote: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            git,
            auto_commit,
            auto_push,
            remote: remote.into(),
            template: template.into(),
        }
    }

    /// Commit all changes in `cwd` and push `branch`.
    ///
    /// Returns `None` when committing is disabled. An unchanged worktree is
    /// [`HealerError::NothingToCommit`].
    pub async fn publish(
        &self,
        cwd: &Path,
        issue: &Issue,
        branch: &str,
        log: &FixLog,
    ) -> Result<Option<CommitResult>> {
        if !self.auto_commit && !self.auto_push {
            log.line("[commit] autoCommit and autoPush disabled; leaving changes uncommitted");
            return Ok(None);
        }

        let status = self.git.run(cwd, &["status", "--porcelain"], None).await?;
        if !status.success() {
            return Err(HealerError::publish("git status", status.stderr.trim()));
        }
        if status.stdout.trim().is_empty() {
            log.line("[commit] no changes detected after applying patch");
            return Err(HealerError::NothingToCommit);
        }

        let mut committed = None;
        if self.auto_commit {
            self.step(cwd, &["add", "-A"], "git add", log).await?;
            let message = format_commit_message(&self.template, issue);
            self.step(cwd, &["commit", "-m", &message], "git commit", log)
                .await?;
            let head = self.git.run(cwd, &["rev-parse", "HEAD"], None).await?;
            if !head.success() {
                return Err(HealerError::publish("git rev-parse", head.stderr.trim()));
            }
            let sha = head.stdout_trimmed().to_string();
            log.line(format!("[commit] {sha} {message}"));
            info!("Committed {} for {}", sha, issue.id);
            committed = Some(sha);
        }

        let mut pushed = false;
        if self.auto_push {
            self.step(cwd, &["push", "-u", &self.remote, branch], "git push", log)
                .await?;
            log.line(format!("[push] {} -> {}", branch, self.remote));
            pushed = true;
        }

        Ok(committed.map(|committed_sha| CommitResult {
            committed_sha,
            pushed,
        }))
    }

    async fn step(&self, cwd: &Path, args: &[&str], label: &str, log: &FixLog) -> Result<()> {
        let out = self.git.run(cwd, args, None).await?;
        if out.success() {
            return Ok(());
        }
        log.line(format!("[commit] {label} failed: {}", out.stderr.trim()));
        Err(HealerError::publish(
            label,
            format!("exit {}{}", out.code, out.describe_tails(4000)),
        ))
    }
}
