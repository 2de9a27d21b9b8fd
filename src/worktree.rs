//! Isolated git worktrees, one per issue.
//!
//! Every issue is fixed on its own branch in `.healer/worktrees/<slug>`, so
//! a failing attempt can be thrown away without touching the developer's
//! checkout. Finished worktrees are removed according to the retention
//! policy; removal refuses any path outside the worktrees directory.

use crate::error::{HealerError, Result};
use crate::fix_log::{parse_outcome, read_tail_text, FixLog, FixOutcome};
use crate::git::{git_checked, GitRunner};
use crate::state::{is_strictly_under, StateDir};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

const OUTCOME_TAIL_BYTES: usize = 64 * 1024;

/// A worktree checked out for one issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    pub base_ref: String,
}

/// How many finished worktrees to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retain_on_success: usize,
    pub retain_on_failure: usize,
}

/// An existing worktree directory and what its logs say about it.
#[derive(Debug, Clone)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub outcome: FixOutcome,
    pub last_active: SystemTime,
}

pub struct WorktreeManager {
    git: Arc<dyn GitRunner>,
    state: StateDir,
}

impl WorktreeManager {
    pub fn new(git: Arc<dyn GitRunner>, state: StateDir) -> Self {
        Self { git, state }
    }

    fn root(&self) -> &Path {
        self.state.workspace_root()
    }

    /// Create the worktree for `issue_id`, or reuse it if it already exists.
    pub async fn ensure(&self, issue_id: &str, base_ref: &str, branch: &str) -> Result<Worktree> {
        let path = self.state.worktree_path(issue_id);
        let worktree = Worktree {
            path: path.clone(),
            branch: branch.to_string(),
            base_ref: base_ref.to_string(),
        };

        if path.exists() {
            if !self.is_worktree(&path).await {
                return Err(HealerError::worktree(
                    &path,
                    "path exists but is not a git worktree",
                ));
            }
            let current = git_checked(self.git.as_ref(), &path, &["rev-parse", "--abbrev-ref", "HEAD"])
                .await
                .map_err(|e| HealerError::worktree(&path, e.to_string()))?;
            if current != branch {
                debug!("Switching reused worktree from {} to {}", current, branch);
                git_checked(self.git.as_ref(), &path, &["switch", branch])
                    .await
                    .map_err(|e| HealerError::worktree(&path, e.to_string()))?;
            }
            return Ok(worktree);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Stale registrations from deleted directories block `worktree add`.
        self.prune_registrations(None).await;

        let path_str = path.to_string_lossy().into_owned();
        let out = self
            .git
            .run(
                self.root(),
                &["worktree", "add", "-B", branch, &path_str, base_ref],
                None,
            )
            .await?;
        if !out.success() {
            return Err(HealerError::worktree(
                &path,
                format!("git worktree add failed: {}", out.stderr.trim()),
            ));
        }
        info!("Created worktree {} on {}", path.display(), branch);
        Ok(worktree)
    }

    async fn is_worktree(&self, path: &Path) -> bool {
        let inside = git_checked(self.git.as_ref(), path, &["rev-parse", "--is-inside-work-tree"]).await;
        if !matches!(inside.as_deref(), Ok("true")) {
            return false;
        }
        // The state dir sits inside the main checkout, so a plain directory
        // also reports "inside"; its top level must be the path itself.
        match git_checked(self.git.as_ref(), path, &["rev-parse", "--show-toplevel"]).await {
            Ok(top) => same_path(Path::new(&top), path),
            Err(_) => false,
        }
    }

    /// Reset the worktree to its base commit and drop untracked files.
    pub async fn reset(&self, worktree: &Worktree) -> Result<()> {
        let reset = self
            .git
            .run(&worktree.path, &["reset", "--hard", &worktree.base_ref], None)
            .await?;
        let clean = self.git.run(&worktree.path, &["clean", "-fd"], None).await?;
        if !reset.success() || !clean.success() {
            let detail = format!("{}\n{}", reset.stderr.trim(), clean.stderr.trim());
            return Err(HealerError::worktree(
                &worktree.path,
                format!("failed to reset worktree to base ref: {}", detail.trim()),
            ));
        }
        Ok(())
    }

    /// Drop git's registrations of worktrees whose directories are gone.
    async fn prune_registrations(&self, log: Option<&FixLog>) {
        let detail = match self
            .git
            .run(self.root(), &["worktree", "prune"], None)
            .await
        {
            Ok(out) if out.success() => return,
            Ok(out) => format!("exit {}: {}", out.code, out.stderr.trim()),
            Err(e) => e.to_string(),
        };
        warn!("git worktree prune failed: {}", detail);
        if let Some(log) = log {
            log.line(format!("[warn] git worktree prune failed: {detail}"));
        }
    }

    /// Remove a worktree directory. Paths not strictly under the worktrees
    /// directory are refused.
    pub async fn remove(&self, path: &Path, log: Option<&FixLog>) -> Result<()> {
        let worktrees_dir = self.state.worktrees_dir();
        if !is_strictly_under(&worktrees_dir, path) {
            return Err(HealerError::UnsafeWorktreePath {
                path: path.to_path_buf(),
            });
        }

        let path_str = path.to_string_lossy().into_owned();
        let out = self
            .git
            .run(self.root(), &["worktree", "remove", "--force", &path_str], None)
            .await?;
        if !out.success() {
            debug!("git worktree remove failed: {}", out.stderr.trim());
        }
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        if let Some(log) = log {
            log.line(format!("[cleanup] removed worktree {}", path.display()));
        }
        info!("Removed worktree {}", path.display());
        Ok(())
    }

    /// Existing worktree directories with their inferred outcome.
    pub fn list(&self) -> Vec<WorktreeEntry> {
        let Ok(entries) = fs::read_dir(self.state.worktrees_dir()) else {
            return Vec::new();
        };
        let logs = self.fix_logs();
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| {
                let path = e.path();
                let name = e.file_name().to_string_lossy().to_lowercase();
                let dir_mtime = modified(&path);
                let log = logs
                    .iter()
                    .filter(|(log_name, _, _)| log_name.contains(&name))
                    .max_by_key(|(_, _, mtime)| *mtime);
                let (outcome, last_active) = match log {
                    Some((_, log_path, log_mtime)) => (
                        parse_outcome(&read_tail_text(log_path, OUTCOME_TAIL_BYTES)),
                        dir_mtime.max(*log_mtime),
                    ),
                    None => (FixOutcome::Unknown, dir_mtime),
                };
                WorktreeEntry {
                    path,
                    outcome,
                    last_active,
                }
            })
            .collect()
    }

    fn fix_logs(&self) -> Vec<(String, PathBuf, SystemTime)> {
        let Ok(entries) = fs::read_dir(self.state.fix_logs_dir()) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| {
                let path = e.path();
                let mtime = modified(&path);
                (e.file_name().to_string_lossy().to_lowercase(), path, mtime)
            })
            .collect()
    }

    /// Remove failed worktrees beyond the newest `keep`, never touching
    /// `protect`. Returns the removed paths.
    pub async fn prune_failed(
        &self,
        keep: usize,
        protect: &HashSet<PathBuf>,
        log: Option<&FixLog>,
    ) -> Result<Vec<PathBuf>> {
        let mut failed: Vec<WorktreeEntry> = self
            .list()
            .into_iter()
            .filter(|e| e.outcome == FixOutcome::Failed)
            .filter(|e| !protect.iter().any(|p| same_path(p, &e.path)))
            .collect();
        failed.sort_by(|a, b| b.last_active.cmp(&a.last_active));

        let mut removed = Vec::new();
        for entry in failed.into_iter().skip(keep) {
            match self.remove(&entry.path, log).await {
                Ok(()) => removed.push(entry.path),
                Err(e) => warn!("Failed to prune worktree {}: {}", entry.path.display(), e),
            }
        }
        if !removed.is_empty() {
            self.prune_registrations(log).await;
        }
        Ok(removed)
    }

    /// Apply the retention policy after an issue finishes.
    ///
    /// A successful worktree is removed unless successes are retained. A
    /// failed one is kept, and older failures are pruned so that at most
    /// `retain_on_failure` failed worktrees remain including this one.
    pub async fn apply_retention(
        &self,
        worktree: &Path,
        succeeded: bool,
        policy: RetentionPolicy,
        log: &FixLog,
    ) -> Result<()> {
        if succeeded {
            if policy.retain_on_success == 0 {
                self.remove(worktree, Some(log)).await?;
            }
            return Ok(());
        }

        if policy.retain_on_failure == 0 {
            self.remove(worktree, Some(log)).await?;
            return Ok(());
        }
        let protect: HashSet<PathBuf> = [worktree.to_path_buf()].into_iter().collect();
        let removed = self
            .prune_failed(policy.retain_on_failure - 1, &protect, Some(log))
            .await?;
        if !removed.is_empty() {
            log.line(format!(
                "[cleanup] pruned {} older failed worktree(s)",
                removed.len()
            ));
        }
        Ok(())
    }
}

fn modified(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use crate::git::GitCli;
    use crate::testing::{git_available, GitFixture, MockGit};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_remove_refuses_paths_outside_root() {
        let tmp = TempDir::new().unwrap();
        let state = StateDir::new(tmp.path());
        let git = Arc::new(MockGit::new());
        let manager = WorktreeManager::new(git.clone(), state.clone());

        for bad in [
            state.worktrees_dir(),
            tmp.path().to_path_buf(),
            state.worktrees_dir().join("../fix-logs"),
        ] {
            let err = manager.remove(&bad, None).await.unwrap_err();
            assert!(matches!(err, HealerError::UnsafeWorktreePath { .. }));
        }
        assert!(git.calls().is_empty());
    }

    #[tokio::test]
    async fn test_existing_plain_directory_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let state = StateDir::new(tmp.path());
        std::fs::create_dir_all(state.worktree_path("dh_1")).unwrap();
        let git = Arc::new(MockGit::new().with_response(
            &["rev-parse", "--is-inside-work-tree"],
            CommandOutput::failed(128, "fatal: not a git repository"),
        ));
        let manager = WorktreeManager::new(git, state);
        let err = manager.ensure("dh_1", "abc", "healer/dh_1").await.unwrap_err();
        assert!(err.to_string().contains("not a git worktree"));
    }

    #[tokio::test]
    async fn test_ensure_adds_with_force_branch() {
        let tmp = TempDir::new().unwrap();
        let state = StateDir::new(tmp.path());
        let git = Arc::new(MockGit::new());
        let manager = WorktreeManager::new(git.clone(), state.clone());
        let wt = manager.ensure("dh_1", "abc123", "healer/dh_1").await.unwrap();
        assert_eq!(wt.path, state.worktree_path("dh_1"));
        let commands = git.commands();
        assert_eq!(commands[0], "worktree prune");
        assert!(commands[1].starts_with("worktree add -B healer/dh_1 "));
        assert!(commands[1].ends_with(" abc123"));
    }

    #[tokio::test]
    async fn test_failed_registration_prune_is_logged() {
        let tmp = TempDir::new().unwrap();
        let state = StateDir::new(tmp.path());
        std::fs::create_dir_all(state.worktree_path("dh_1")).unwrap();
        state
            .write_artifact(&state.fix_log_path("dh_1"), "[result] failed\n")
            .unwrap();
        let git = Arc::new(MockGit::new().with_response(
            &["worktree", "prune"],
            CommandOutput::failed(128, "fatal: unable to lock"),
        ));
        let manager = WorktreeManager::new(git, state.clone());
        let log = FixLog::create(tmp.path().join("run.log")).unwrap();

        let removed = manager
            .prune_failed(0, &HashSet::new(), Some(&log))
            .await
            .unwrap();
        assert_eq!(removed, vec![state.worktree_path("dh_1")]);
        assert!(log
            .tail_lines(5)
            .contains("[warn] git worktree prune failed: exit 128: fatal: unable to lock"));
    }

    #[tokio::test]
    async fn test_reset_failure_is_worktree_error() {
        let git = Arc::new(
            MockGit::new().with_response(&["reset"], CommandOutput::failed(1, "bad ref")),
        );
        let manager = WorktreeManager::new(git, StateDir::new("/ws"));
        let wt = Worktree {
            path: PathBuf::from("/ws/.healer/worktrees/dh_1"),
            branch: "healer/dh_1".into(),
            base_ref: "abc".into(),
        };
        let err = manager.reset(&wt).await.unwrap_err();
        assert!(err.to_string().contains("failed to reset worktree to base ref"));
    }

    #[tokio::test]
    async fn test_real_worktree_create_reuse_and_remove() {
        if !git_available() {
            return;
        }
        let repo = GitFixture::new();
        let state = StateDir::new(repo.path());
        state.ensure().unwrap();
        let manager = WorktreeManager::new(Arc::new(GitCli::new()), state.clone());
        let base = repo.head();

        let wt = manager.ensure("dh_1", &base, "healer/dh_1").await.unwrap();
        assert!(wt.path.join("README.md").exists());

        // Reuse is idempotent.
        let again = manager.ensure("dh_1", &base, "healer/dh_1").await.unwrap();
        assert_eq!(again.path, wt.path);

        std::fs::write(wt.path.join("scratch.txt"), "x").unwrap();
        manager.reset(&wt).await.unwrap();
        assert!(!wt.path.join("scratch.txt").exists());

        manager.remove(&wt.path, None).await.unwrap();
        assert!(!wt.path.exists());
    }
}
