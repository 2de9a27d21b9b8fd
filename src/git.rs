//! Git command execution.
//!
//! All git access goes through [`GitRunner`] so stages can be tested against
//! [`MockGit`](crate::testing::MockGit) without touching a repository.

use crate::error::{HealerError, Result};
use crate::process::{run_captured, CommandOutput};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Runs `git <args>` in a directory.
///
/// A non-zero exit is not an error at this level; callers inspect
/// [`CommandOutput::code`]. `Err` means git could not be run at all.
#[async_trait]
pub trait GitRunner: Send + Sync {
    async fn run(&self, cwd: &Path, args: &[&str], input: Option<&str>) -> Result<CommandOutput>;
}

/// [`GitRunner`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitCli {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that `git` is on PATH.
    pub fn ensure_available(&self) -> Result<()> {
        which::which(&self.program).map_err(|_| HealerError::MissingTool {
            tool: self.program.clone(),
        })?;
        Ok(())
    }
}

#[async_trait]
impl GitRunner for GitCli {
    async fn run(&self, cwd: &Path, args: &[&str], input: Option<&str>) -> Result<CommandOutput> {
        debug!("git {} (in {})", args.join(" "), cwd.display());
        let mut cmd = Command::new(&self.program);
        cmd.args(args).current_dir(cwd);
        run_captured(cmd, input)
            .await
            .map_err(|e| HealerError::git(args.first().copied().unwrap_or("git"), e.to_string()))
    }
}

/// Run git and require exit 0, returning trimmed stdout.
pub async fn git_checked(git: &dyn GitRunner, cwd: &Path, args: &[&str]) -> Result<String> {
    let out = git.run(cwd, args, None).await?;
    if !out.success() {
        let detail = if out.stderr.trim().is_empty() {
            out.stdout.trim()
        } else {
            out.stderr.trim()
        };
        return Err(HealerError::git(
            args.join(" "),
            format!("exit {}: {}", out.code, detail),
        ));
    }
    Ok(out.stdout_trimmed().to_string())
}

/// Current HEAD commit of `cwd`.
pub async fn head_sha(git: &dyn GitRunner, cwd: &Path) -> Result<String> {
    git_checked(git, cwd, &["rev-parse", "HEAD"]).await
}

/// Current branch name, or `HEAD` when detached.
pub async fn current_branch(git: &dyn GitRunner, cwd: &Path) -> Result<String> {
    git_checked(git, cwd, &["rev-parse", "--abbrev-ref", "HEAD"]).await
}

/// Paths with unresolved merge conflicts.
pub async fn unmerged_paths(git: &dyn GitRunner, cwd: &Path) -> Vec<String> {
    match git
        .run(cwd, &["diff", "--name-only", "--diff-filter=U"], None)
        .await
    {
        Ok(out) if out.success() => out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
