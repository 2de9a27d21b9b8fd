//! Bringing a committed fix back into the main workspace.
//!
//! Reintegration is best effort. The fix already lives on its own branch,
//! so nothing here fails an issue; every outcome is reported as a
//! [`ReintegrationResult`] and logged.

use crate::config::{ReintegrationConfig, ReintegrationStrategy};
use crate::error::{HealerError, Result};
use crate::fix_log::FixLog;
use crate::git::{unmerged_paths, GitRunner};
use crate::issue::to_base36;
use crate::process::CommandOutput;
use chrono::Utc;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// How an applied fix landed in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedVia {
    Clean,
    StashAndPop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    NoSha,
    StrategyOff,
    GitStatusFailed,
    DirtyWorktree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    StashPush,
    CherryPick,
    /// `cherry-pick --abort` failed; the workspace is mid-pick.
    CherryPickAbort,
    SwitchBranch,
    Exception(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::NoSha => "no-sha",
            Self::StrategyOff => "strategy-off",
            Self::GitStatusFailed => "git-status-failed",
            Self::DirtyWorktree => "dirty-worktree",
        };
        f.write_str(s)
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StashPush => f.write_str("stash-push"),
            Self::CherryPick => f.write_str("cherry-pick"),
            Self::CherryPickAbort => f.write_str("cherry-pick-abort"),
            Self::SwitchBranch => f.write_str("switch-branch"),
            Self::Exception(msg) => write!(f, "exception: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReintegrationResult {
    /// The fix commit is on the workspace's current branch.
    Applied {
        via: AppliedVia,
        /// Files left conflicted by restoring the developer's changes.
        conflicts: Vec<String>,
    },
    /// The fix was cherry-picked onto a new local branch instead.
    SideBranch { branch: String },
    Skipped(SkipReason),
    Failed(FailReason),
}

impl ReintegrationResult {
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

impl fmt::Display for ReintegrationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied { via, conflicts } if conflicts.is_empty() => {
                write!(f, "applied ({via:?})")
            }
            Self::Applied { via, conflicts } => write!(
                f,
                "applied ({via:?}) with {} conflicted file(s)",
                conflicts.len()
            ),
            Self::SideBranch { branch } => write!(f, "applied to new branch {branch}"),
            Self::Skipped(reason) => write!(f, "skipped: {reason}"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

enum Pick {
    Applied,
    Aborted,
    /// The abort failed too; nothing may touch the index until a human does.
    Stuck,
}

/// Where `new_branch` has to return to.
enum Origin {
    Branch(String),
    Detached(String),
}

impl Origin {
    fn switch_args(&self) -> Vec<&str> {
        match self {
            Self::Branch(name) => vec!["switch", name.as_str()],
            Self::Detached(sha) => vec!["switch", "--detach", sha.as_str()],
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Branch(name) => f.write_str(name),
            Self::Detached(sha) => write!(f, "detached HEAD at {}", short(sha)),
        }
    }
}

pub struct WorkspaceReintegrator {
    git: Arc<dyn GitRunner>,
    root: PathBuf,
    config: ReintegrationConfig,
    branch_prefix: String,
}

impl WorkspaceReintegrator {
    pub fn new(
        git: Arc<dyn GitRunner>,
        root: impl Into<PathBuf>,
        config: ReintegrationConfig,
        branch_prefix: impl Into<String>,
    ) -> Self {
        Self {
            git,
            root: root.into(),
            config,
            branch_prefix: branch_prefix.into(),
        }
    }

    /// Apply `sha` to the workspace according to the configured strategy.
    pub async fn reintegrate(
        &self,
        sha: Option<&str>,
        issue_id: &str,
        log: &FixLog,
    ) -> ReintegrationResult {
        let result = match self.try_reintegrate(sha, issue_id, log).await {
            Ok(result) => result,
            Err(e) => {
                let err = HealerError::ReintegrationFailed {
                    message: e.to_string(),
                };
                log.line(format!("[warn] workspace apply threw (non-fatal): {err}"));
                ReintegrationResult::Failed(FailReason::Exception(e.to_string()))
            }
        };
        log.line(format!("[reintegrate] {result}"));
        info!("Reintegration for {}: {}", issue_id, result);
        result
    }

    async fn git(&self, args: &[&str]) -> Result<CommandOutput> {
        self.git.run(&self.root, args, None).await
    }

    async fn stash_top(&self) -> Result<String> {
        let out = self.git(&["stash", "list", "-1", "--format=%H"]).await?;
        Ok(if out.success() {
            out.stdout_trimmed().to_string()
        } else {
            String::new()
        })
    }

    /// Stash local changes; `Some(hash)` when a new stash entry was created.
    async fn stash(&self, issue_id: &str, sha: &str, log: &FixLog) -> Result<std::result::Result<Option<String>, FailReason>> {
        let before = self.stash_top().await?;
        let message = format!(
            "healer-autostash {} {} {}",
            issue_id,
            short(sha),
            Utc::now().to_rfc3339()
        );
        log.line(format!("[step] stash local changes: git stash push -u -m \"{message}\""));
        let push = self.git(&["stash", "push", "-u", "-m", &message]).await?;
        if !push.success() {
            log.line(format!(
                "[warn] git stash push failed; skipping workspace apply of {sha} (non-fatal)"
            ));
            return Ok(Err(FailReason::StashPush));
        }
        let after = self.stash_top().await?;
        Ok(Ok((!after.is_empty() && after != before).then_some(after)))
    }

    /// Pop our stash entry, refusing if something else is on top.
    async fn restore(&self, stash: &str, log: &FixLog) -> Result<Vec<String>> {
        let top = self.stash_top().await?;
        if top != stash {
            log.line(format!(
                "[warn] stash top changed; not popping. Restore manually with `git stash apply {stash}`"
            ));
            return Ok(Vec::new());
        }
        log.line("[step] restore workspace changes: git stash pop");
        let pop = self.git(&["stash", "pop"]).await?;
        if pop.success() {
            return Ok(Vec::new());
        }
        let conflicts = unmerged_paths(self.git.as_ref(), &self.root).await;
        log.line(format!(
            "[warn] stash pop had conflicts or failed (non-fatal).{}",
            pop.describe_tails(4000)
        ));
        if !conflicts.is_empty() {
            log.line(format!(
                "[warn] workspace has merge conflicts after stash pop; resolve these files, then `git add` them: {}",
                conflicts.join(", ")
            ));
        }
        warn!("Stash pop left {} conflicted file(s)", conflicts.len());
        Ok(conflicts)
    }

    async fn cherry_pick(&self, sha: &str, log: &FixLog) -> Result<Pick> {
        log.line(format!(
            "[step] cherry-pick fix commit into workspace: git cherry-pick {sha}"
        ));
        let out = self.git(&["cherry-pick", sha]).await?;
        if out.success() {
            return Ok(Pick::Applied);
        }
        log.line(format!(
            "[warn] workspace cherry-pick failed (non-fatal): {}{}",
            out.code,
            out.describe_tails(4000)
        ));
        let abort = self.git(&["cherry-pick", "--abort"]).await?;
        if abort.success() {
            return Ok(Pick::Aborted);
        }
        log.line(format!(
            "[warn] git cherry-pick --abort failed; workspace is mid cherry-pick. Resolve or abort it manually.{}",
            abort.describe_tails(2000)
        ));
        warn!("cherry-pick --abort failed in {}", self.root.display());
        Ok(Pick::Stuck)
    }

    /// Log how to recover a stash that was deliberately left in place.
    fn keep_stash(&self, stash: Option<&String>, log: &FixLog) {
        if let Some(stash) = stash {
            log.line(format!(
                "[warn] local changes left stashed; restore them with `git stash apply {stash}`"
            ));
        }
    }

    async fn origin(&self) -> Result<Option<Origin>> {
        let current = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let name = current.stdout_trimmed();
        if !current.success() || name.is_empty() {
            return Ok(None);
        }
        if name != "HEAD" {
            return Ok(Some(Origin::Branch(name.to_string())));
        }
        let head = self.git(&["rev-parse", "HEAD"]).await?;
        let sha = head.stdout_trimmed();
        Ok((head.success() && !sha.is_empty()).then(|| Origin::Detached(sha.to_string())))
    }

    async fn try_reintegrate(
        &self,
        sha: Option<&str>,
        issue_id: &str,
        log: &FixLog,
    ) -> Result<ReintegrationResult> {
        if !self.config.enabled {
            return Ok(ReintegrationResult::Skipped(SkipReason::Disabled));
        }
        let Some(sha) = sha.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(ReintegrationResult::Skipped(SkipReason::NoSha));
        };
        if self.config.strategy == ReintegrationStrategy::Off {
            return Ok(ReintegrationResult::Skipped(SkipReason::StrategyOff));
        }

        let status = self.git(&["status", "--porcelain"]).await?;
        if !status.success() {
            log.line(format!(
                "[warn] git status failed; skipping workspace apply of {sha}"
            ));
            return Ok(ReintegrationResult::Skipped(SkipReason::GitStatusFailed));
        }
        let dirty = !status.stdout.trim().is_empty();

        if !dirty {
            return Ok(match self.cherry_pick(sha, log).await? {
                Pick::Applied => ReintegrationResult::Applied {
                    via: AppliedVia::Clean,
                    conflicts: Vec::new(),
                },
                Pick::Aborted => ReintegrationResult::Failed(FailReason::CherryPick),
                Pick::Stuck => ReintegrationResult::Failed(FailReason::CherryPickAbort),
            });
        }

        match self.config.strategy {
            ReintegrationStrategy::SkipIfDirty | ReintegrationStrategy::Off => {
                log.line(format!(
                    "[warn] workspace has local changes; skipping cherry-pick of {sha}"
                ));
                Ok(ReintegrationResult::Skipped(SkipReason::DirtyWorktree))
            }
            ReintegrationStrategy::StashAndPop => self.stash_and_pop(sha, issue_id, log).await,
            ReintegrationStrategy::NewBranch => self.new_branch(sha, issue_id, log).await,
        }
    }

    async fn stash_and_pop(
        &self,
        sha: &str,
        issue_id: &str,
        log: &FixLog,
    ) -> Result<ReintegrationResult> {
        let stash = match self.stash(issue_id, sha, log).await? {
            Ok(stash) => stash,
            Err(reason) => return Ok(ReintegrationResult::Failed(reason)),
        };

        match self.cherry_pick(sha, log).await? {
            Pick::Applied => {}
            Pick::Aborted => {
                if let Some(stash) = &stash {
                    self.restore(stash, log).await?;
                }
                return Ok(ReintegrationResult::Failed(FailReason::CherryPick));
            }
            Pick::Stuck => {
                self.keep_stash(stash.as_ref(), log);
                return Ok(ReintegrationResult::Failed(FailReason::CherryPickAbort));
            }
        }

        let conflicts = match &stash {
            Some(stash) => self.restore(stash, log).await?,
            None => Vec::new(),
        };
        Ok(ReintegrationResult::Applied {
            via: AppliedVia::StashAndPop,
            conflicts,
        })
    }

    async fn new_branch(
        &self,
        sha: &str,
        issue_id: &str,
        log: &FixLog,
    ) -> Result<ReintegrationResult> {
        let Some(origin) = self.origin().await? else {
            log.line(format!(
                "[warn] cannot resolve the current HEAD; skipping new-branch apply of {sha}"
            ));
            return Ok(ReintegrationResult::Failed(FailReason::SwitchBranch));
        };

        let stash = match self.stash(issue_id, sha, log).await? {
            Ok(stash) => stash,
            Err(reason) => return Ok(ReintegrationResult::Failed(reason)),
        };

        let mut branch = format!("{}apply/{}", self.branch_prefix, issue_id);
        let reference = format!("refs/heads/{branch}");
        let exists = self
            .git(&["show-ref", "--verify", "--quiet", &reference])
            .await?;
        if exists.success() {
            let millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
            branch = format!("{branch}-{}", to_base36(millis));
        }

        log.line(format!("[step] create branch: git switch -c {branch}"));
        let switched = self.git(&["switch", "-c", &branch]).await?;
        if !switched.success() {
            if let Some(stash) = &stash {
                self.restore(stash, log).await?;
            }
            return Ok(ReintegrationResult::Failed(FailReason::SwitchBranch));
        }

        let picked = self.cherry_pick(sha, log).await?;
        if let Pick::Stuck = picked {
            self.keep_stash(stash.as_ref(), log);
            return Ok(ReintegrationResult::Failed(FailReason::CherryPickAbort));
        }

        log.line(format!("[step] return to {origin}: git {}", origin.switch_args().join(" ")));
        let back = self.git(&origin.switch_args()).await?;
        if !back.success() {
            log.line(format!(
                "[warn] could not return to {origin}; still on {branch}.{}",
                back.describe_tails(2000)
            ));
            self.keep_stash(stash.as_ref(), log);
            return Ok(ReintegrationResult::Failed(FailReason::SwitchBranch));
        }
        if let Some(stash) = &stash {
            self.restore(stash, log).await?;
        }
        if let Pick::Aborted = picked {
            return Ok(ReintegrationResult::Failed(FailReason::CherryPick));
        }

        log.line(format!("[info] fix commit applied to new local branch: {branch}"));
        Ok(ReintegrationResult::SideBranch { branch })
    }
}

fn short(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockGit;
    use tempfile::TempDir;

    fn reintegrator(git: Arc<MockGit>, strategy: ReintegrationStrategy) -> WorkspaceReintegrator {
        WorkspaceReintegrator::new(
            git,
            "/ws",
            ReintegrationConfig {
                enabled: true,
                strategy,
            },
            "healer/",
        )
    }

    fn log() -> (TempDir, FixLog) {
        let tmp = TempDir::new().unwrap();
        let log = FixLog::create(tmp.path().join("log")).unwrap();
        (tmp, log)
    }

    #[tokio::test]
    async fn test_skip_reasons() {
        let (_tmp, log) = log();
        let git = Arc::new(MockGit::new());
        let disabled = WorkspaceReintegrator::new(
            git.clone(),
            "/ws",
            ReintegrationConfig {
                enabled: false,
                strategy: ReintegrationStrategy::StashAndPop,
            },
            "healer/",
        );
        assert_eq!(
            disabled.reintegrate(Some("abc"), "dh_1", &log).await,
            ReintegrationResult::Skipped(SkipReason::Disabled)
        );
        let r = reintegrator(git.clone(), ReintegrationStrategy::StashAndPop);
        assert_eq!(
            r.reintegrate(None, "dh_1", &log).await,
            ReintegrationResult::Skipped(SkipReason::NoSha)
        );
        let off = reintegrator(git.clone(), ReintegrationStrategy::Off);
        assert_eq!(
            off.reintegrate(Some("abc"), "dh_1", &log).await,
            ReintegrationResult::Skipped(SkipReason::StrategyOff)
        );
        assert!(git.calls().is_empty());
    }

    #[tokio::test]
    async fn test_clean_tree_cherry_picks() {
        let (_tmp, log) = log();
        let git = Arc::new(MockGit::new());
        let r = reintegrator(git.clone(), ReintegrationStrategy::StashAndPop);
        let result = r.reintegrate(Some("abc123"), "dh_1", &log).await;
        assert_eq!(
            result,
            ReintegrationResult::Applied {
                via: AppliedVia::Clean,
                conflicts: vec![]
            }
        );
        assert_eq!(git.commands(), vec!["status --porcelain", "cherry-pick abc123"]);
    }

    #[tokio::test]
    async fn test_dirty_skip_if_dirty() {
        let (_tmp, log) = log();
        let git = Arc::new(
            MockGit::new().with_response(&["status", "--porcelain"], CommandOutput::ok(" M a\n")),
        );
        let r = reintegrator(git.clone(), ReintegrationStrategy::SkipIfDirty);
        assert_eq!(
            r.reintegrate(Some("abc"), "dh_1", &log).await,
            ReintegrationResult::Skipped(SkipReason::DirtyWorktree)
        );
        assert!(!git.was_called(&["cherry-pick"]));
    }

    #[tokio::test]
    async fn test_stash_and_pop_verifies_stash_top() {
        let (_tmp, log) = log();
        let git = Arc::new(
            MockGit::new()
                .with_response(&["status", "--porcelain"], CommandOutput::ok(" M a\n"))
                .with_responses(
                    &["stash", "list"],
                    vec![
                        CommandOutput::ok(""),
                        CommandOutput::ok("s1\n"),
                        CommandOutput::ok("s1\n"),
                    ],
                ),
        );
        let r = reintegrator(git.clone(), ReintegrationStrategy::StashAndPop);
        let result = r.reintegrate(Some("abc"), "dh_1", &log).await;
        assert!(result.applied());
        let commands = git.commands();
        let pick = commands.iter().position(|c| c == "cherry-pick abc").unwrap();
        let pop = commands.iter().position(|c| c == "stash pop").unwrap();
        assert!(commands[..pick].iter().any(|c| c.starts_with("stash push -u -m healer-autostash dh_1 abc ")));
        assert!(pick < pop);
    }

    #[tokio::test]
    async fn test_foreign_stash_is_not_popped() {
        let (_tmp, log) = log();
        let git = Arc::new(
            MockGit::new()
                .with_response(&["status", "--porcelain"], CommandOutput::ok(" M a\n"))
                .with_responses(
                    &["stash", "list"],
                    vec![
                        CommandOutput::ok(""),
                        CommandOutput::ok("ours\n"),
                        CommandOutput::ok("someone-else\n"),
                    ],
                ),
        );
        let r = reintegrator(git.clone(), ReintegrationStrategy::StashAndPop);
        assert!(r.reintegrate(Some("abc"), "dh_1", &log).await.applied());
        assert!(!git.was_called(&["stash", "pop"]));
    }

    #[tokio::test]
    async fn test_pop_conflict_reports_files() {
        let (_tmp, log) = log();
        let git = Arc::new(
            MockGit::new()
                .with_response(&["status", "--porcelain"], CommandOutput::ok(" M a\n"))
                .with_responses(
                    &["stash", "list"],
                    vec![CommandOutput::ok(""), CommandOutput::ok("s1\n"), CommandOutput::ok("s1\n")],
                )
                .with_response(&["stash", "pop"], CommandOutput::failed(1, "CONFLICT (content)"))
                .with_response(
                    &["diff", "--name-only", "--diff-filter=U"],
                    CommandOutput::ok("src/a.ts\n"),
                ),
        );
        let r = reintegrator(git, ReintegrationStrategy::StashAndPop);
        let result = r.reintegrate(Some("abc"), "dh_1", &log).await;
        assert_eq!(
            result,
            ReintegrationResult::Applied {
                via: AppliedVia::StashAndPop,
                conflicts: vec!["src/a.ts".into()]
            }
        );
        assert!(std::fs::read_to_string(log.path()).unwrap().contains("src/a.ts"));
    }

    #[tokio::test]
    async fn test_cherry_pick_failure_restores_stash() {
        let (_tmp, log) = log();
        let git = Arc::new(
            MockGit::new()
                .with_response(&["status", "--porcelain"], CommandOutput::ok(" M a\n"))
                .with_responses(
                    &["stash", "list"],
                    vec![CommandOutput::ok("old\n"), CommandOutput::ok("s1\n"), CommandOutput::ok("s1\n")],
                )
                .with_response(&["cherry-pick", "abc"], CommandOutput::failed(1, "conflict")),
        );
        let r = reintegrator(git.clone(), ReintegrationStrategy::StashAndPop);
        assert_eq!(
            r.reintegrate(Some("abc"), "dh_1", &log).await,
            ReintegrationResult::Failed(FailReason::CherryPick)
        );
        assert!(git.was_called(&["cherry-pick", "--abort"]));
        assert!(git.was_called(&["stash", "pop"]));
    }

    #[tokio::test]
    async fn test_new_branch_leaves_current_branch() {
        let (_tmp, log) = log();
        let git = Arc::new(
            MockGit::new()
                .with_response(&["status", "--porcelain"], CommandOutput::ok(" M a\n"))
                .with_response(&["rev-parse", "--abbrev-ref", "HEAD"], CommandOutput::ok("main\n"))
                .with_response(&["show-ref"], CommandOutput::failed(1, "")),
        );
        let r = reintegrator(git.clone(), ReintegrationStrategy::NewBranch);
        let result = r.reintegrate(Some("abc"), "dh_1", &log).await;
        assert_eq!(
            result,
            ReintegrationResult::SideBranch {
                branch: "healer/apply/dh_1".into()
            }
        );
        assert!(!result.applied());
        assert!(git.was_called(&["switch", "-c", "healer/apply/dh_1"]));
        assert!(git.was_called(&["switch", "main"]));
    }

    fn dirty_with_stash() -> MockGit {
        MockGit::new()
            .with_response(&["status", "--porcelain"], CommandOutput::ok(" M a\n"))
            .with_responses(
                &["stash", "list"],
                vec![CommandOutput::ok(""), CommandOutput::ok("s1\n")],
            )
            .with_response(&["show-ref"], CommandOutput::failed(1, ""))
    }

    #[tokio::test]
    async fn test_new_branch_keeps_stash_when_switch_back_fails() {
        let (_tmp, log) = log();
        let git = Arc::new(
            dirty_with_stash()
                .with_response(&["rev-parse", "--abbrev-ref", "HEAD"], CommandOutput::ok("main\n"))
                .with_response(&["switch", "main"], CommandOutput::failed(1, "error: local changes")),
        );
        let r = reintegrator(git.clone(), ReintegrationStrategy::NewBranch);
        assert_eq!(
            r.reintegrate(Some("abc"), "dh_1", &log).await,
            ReintegrationResult::Failed(FailReason::SwitchBranch)
        );
        assert!(git.was_called(&["cherry-pick", "abc"]));
        assert!(!git.was_called(&["stash", "pop"]));
        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(text.contains("could not return to main"));
        assert!(text.contains("git stash apply s1"));
    }

    #[tokio::test]
    async fn test_new_branch_returns_to_detached_head() {
        let (_tmp, log) = log();
        let git = Arc::new(
            dirty_with_stash()
                .with_response(&["rev-parse", "--abbrev-ref", "HEAD"], CommandOutput::ok("HEAD\n"))
                .with_response(&["rev-parse", "HEAD"], CommandOutput::ok("deadbeef\n")),
        );
        let r = reintegrator(git.clone(), ReintegrationStrategy::NewBranch);
        assert_eq!(
            r.reintegrate(Some("abc"), "dh_1", &log).await,
            ReintegrationResult::SideBranch {
                branch: "healer/apply/dh_1".into()
            }
        );
        let commands = git.commands();
        let back = commands
            .iter()
            .position(|c| c == "switch --detach deadbeef")
            .unwrap();
        let pop = commands.iter().position(|c| c == "stash pop").unwrap();
        assert!(back < pop);
    }

    #[tokio::test]
    async fn test_failed_abort_leaves_stash_in_place() {
        let (_tmp, log) = log();
        let git = Arc::new(
            dirty_with_stash()
                .with_response(&["cherry-pick", "abc"], CommandOutput::failed(1, "conflict"))
                .with_response(&["cherry-pick", "--abort"], CommandOutput::failed(128, "no cherry-pick in progress")),
        );
        let r = reintegrator(git.clone(), ReintegrationStrategy::StashAndPop);
        assert_eq!(
            r.reintegrate(Some("abc"), "dh_1", &log).await,
            ReintegrationResult::Failed(FailReason::CherryPickAbort)
        );
        assert!(!git.was_called(&["stash", "pop"]));
        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(text.contains("[warn] git cherry-pick --abort failed"));
        assert!(text.contains("git stash apply s1"));
    }
}
