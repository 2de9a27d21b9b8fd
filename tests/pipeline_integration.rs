//! End-to-end pipeline runs against real git repositories.

mod common;

use common::{git_available, TestRepo};
use healer::config::AgentConfig;
use healer::process::CommandOutput;
use healer::reintegrate::{AppliedVia, ReintegrationResult};
use healer::state::StateDir;
use healer::{
    FixPipeline, GitCli, HealerConfig, HealerError, Issue, IssueKind, MockPatchAgent,
    PipelineContext,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const FIX_B: &str = "diff --git a/src/b.ts b/src/b.ts
--- a/src/b.ts
+++ b/src/b.ts
@@ -1 +1 @@
-export const b = 1;
+export const b = 2;
";

const STALE_B: &str = "diff --git a/src/b.ts b/src/b.ts
--- a/src/b.ts
+++ b/src/b.ts
@@ -1 +1 @@
-export const b = 100;
+export const b = 2;
";

fn config() -> HealerConfig {
    HealerConfig {
        auto_push: false,
        agent: AgentConfig {
            command: "mock-agent".into(),
            ..Default::default()
        },
        ..HealerConfig::default()
    }
}

fn pipeline(repo: &TestRepo, agent: Arc<MockPatchAgent>, config: HealerConfig) -> FixPipeline {
    let ctx = PipelineContext::new(repo.path(), config, Arc::new(GitCli::new()), agent);
    FixPipeline::new(ctx).unwrap()
}

fn repo_with_sources() -> TestRepo {
    let repo = TestRepo::new();
    repo.write("src/a.ts", "export const a = 1;\n");
    repo.write("src/b.ts", "export const b = 1;\n");
    repo.commit_all("add sources");
    repo
}

fn issue(title: &str) -> Issue {
    Issue::new(title, "test", IssueKind::Runtime).with_prompt_text("fix src/b.ts")
}

#[tokio::test]
async fn test_fix_is_reintegrated_around_uncommitted_work() {
    if !git_available() {
        return;
    }
    let repo = repo_with_sources();
    repo.write("src/a.ts", "export const a = 42;\n");

    let agent = Arc::new(MockPatchAgent::new().with_diff(FIX_B));
    let p = pipeline(&repo, agent.clone(), config());
    let report = p.run_issue(&issue("b is wrong")).await.unwrap();

    assert_eq!(report.attempts, 1);
    assert!(matches!(
        report.reintegration,
        Some(ReintegrationResult::Applied {
            via: AppliedVia::StashAndPop,
            ..
        })
    ));
    assert_eq!(repo.read("src/b.ts"), "export const b = 2;\n");
    assert_eq!(repo.read("src/a.ts"), "export const a = 42;\n");
    assert!(repo
        .git(&["log", "-1", "--format=%s"])
        .starts_with("Healer: b is wrong"));
    assert!(repo.git(&["stash", "list"]).is_empty());

    // Successful worktrees are not retained by default.
    assert!(!report.workdir.exists());
    assert!(repo.worktree_dirs().is_empty());
}

#[tokio::test]
async fn test_clean_workspace_cherry_picks_directly() {
    if !git_available() {
        return;
    }
    let repo = repo_with_sources();
    let agent = Arc::new(MockPatchAgent::new().with_diff(FIX_B));
    let cfg = HealerConfig {
        worktree_retain_on_success: 1,
        ..config()
    };
    let report = pipeline(&repo, agent, cfg)
        .run_issue(&issue("b is wrong"))
        .await
        .unwrap();

    assert!(matches!(
        report.reintegration,
        Some(ReintegrationResult::Applied {
            via: AppliedVia::Clean,
            ..
        })
    ));
    assert!(report.workdir.exists());
    assert!(report.branch.starts_with("healer/"));
    let commit = report.commit.unwrap();
    assert_eq!(
        repo.git(&["rev-parse", &report.branch]),
        commit.committed_sha
    );
    assert!(!commit.pushed);
}

#[tokio::test]
async fn test_non_applying_patch_exhausts_attempts() {
    if !git_available() {
        return;
    }
    let repo = repo_with_sources();
    let agent = Arc::new(MockPatchAgent::new().with_diff(STALE_B));
    let p = pipeline(&repo, agent.clone(), config());
    let issue = issue("stale context");

    let err = p.run_issue(&issue).await.unwrap_err();
    assert!(matches!(err, HealerError::NonApplyingPatch { .. }));
    assert_eq!(agent.call_count(), 3);

    let calls = agent.calls();
    assert!(calls[0].mode.stream_partial);
    assert!(calls[1].prompt.contains("Make the smallest possible targeted edits"));
    assert!(calls[1].prompt.contains("Previous attempt failed"));
    assert!(!calls[1].mode.stream_partial);

    let state = StateDir::new(repo.path());
    for n in 1..=3 {
        assert!(state.attempt_error_path(issue.id.as_str(), n).exists());
    }
    assert!(state.patch_path(issue.id.as_str(), Some(3), false).exists());

    // The workspace is untouched and the failed worktree is kept.
    assert_eq!(repo.read("src/b.ts"), "export const b = 1;\n");
    assert_eq!(repo.worktree_dirs().len(), 1);
}

/// Set the modification time of a file or directory.
#[cfg(unix)]
fn set_mtime(path: &Path, time: SystemTime) {
    std::fs::File::open(path).unwrap().set_modified(time).unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_worktrees_are_pruned_to_retention_count() {
    if !git_available() {
        return;
    }
    let repo = repo_with_sources();
    let agent = Arc::new(MockPatchAgent::new().with_output(CommandOutput::failed(1, "agent crashed")));
    let cfg = HealerConfig {
        max_attempts_per_issue: 1,
        worktree_retain_on_failure: 2,
        ..config()
    };
    let p = pipeline(&repo, agent, cfg);
    let state = StateDir::new(repo.path());
    let base = SystemTime::now() - Duration::from_secs(3600);

    let mut worktrees = Vec::new();
    for n in 0..4u64 {
        let issue = issue(&format!("failure {n}"));
        assert!(p.run_issue(&issue).await.is_err());
        let worktree = state.worktree_path(issue.id.as_str());
        // Each earlier failure is a minute older than the next one.
        let when = base + Duration::from_secs(60 * n);
        set_mtime(&worktree, when);
        set_mtime(&state.fix_log_path(issue.id.as_str()), when);
        worktrees.push(worktree);
    }

    let mut survivors = repo.worktree_dirs();
    survivors.sort();
    let mut expected = vec![worktrees[2].clone(), worktrees[3].clone()];
    expected.sort();
    assert_eq!(survivors, expected);
    assert!(!worktrees[0].exists());
    assert!(!worktrees[1].exists());
}

#[tokio::test]
async fn test_failing_verification_blocks_commit() {
    if !git_available() {
        return;
    }
    let repo = repo_with_sources();
    let check = "grep -q 'b = 3' src/b.ts".to_string();
    let cfg = HealerConfig {
        max_attempts_per_issue: 2,
        post_fix_commands: vec![check.clone()],
        post_fix_commands_allowlist: vec![check],
        ..config()
    };
    let agent = Arc::new(MockPatchAgent::new().with_diff(FIX_B));
    let err = pipeline(&repo, agent.clone(), cfg)
        .run_issue(&issue("needs three"))
        .await
        .unwrap_err();

    assert!(matches!(err, HealerError::PostFixCheckFailed { .. }));
    assert_eq!(agent.call_count(), 2);
    assert_eq!(repo.git(&["rev-list", "--count", "HEAD"]), "2");
}

#[tokio::test]
async fn test_without_worktrees_commits_on_current_branch() {
    if !git_available() {
        return;
    }
    let repo = repo_with_sources();
    let cfg = HealerConfig {
        use_worktrees: false,
        ..config()
    };
    let agent = Arc::new(MockPatchAgent::new().with_diff(FIX_B));
    let report = pipeline(&repo, agent, cfg)
        .run_issue(&issue("in place"))
        .await
        .unwrap();

    assert_eq!(report.branch, "main");
    assert!(report.reintegration.is_none());
    assert_eq!(repo.read("src/b.ts"), "export const b = 2;\n");
    assert_eq!(
        repo.git(&["rev-parse", "HEAD"]),
        report.commit.unwrap().committed_sha
    );
}
