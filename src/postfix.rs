//! Post-fix verification commands.
//!
//! Configured commands run in the worktree after the patch applies. A
//! non-empty allowlist restricts them to the commands it lists verbatim. A command matching the
//! format-guard trigger is replaced by a formatter check scoped to the files
//! the fix changed; if that check fails the formatter writes once and the
//! check is repeated.

use crate::config::FormatGuardConfig;
use crate::error::{HealerError, Result};
use crate::fix_log::FixLog;
use crate::git::GitRunner;
use crate::process::{run_streaming, shell_command, CommandOutput, ProcessEvent};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};

const FAILURE_TAIL_CHARS: usize = 8000;

pub struct PostFixRunner {
    git: Arc<dyn GitRunner>,
    commands: Vec<String>,
    allowlist: Vec<String>,
    guard: FormatGuard,
}

struct FormatGuard {
    trigger: Option<Regex>,
    check: Vec<String>,
    write: Vec<String>,
    exclude: GlobSet,
}

impl FormatGuard {
    fn new(config: &FormatGuardConfig) -> Result<Self> {
        let trigger = if config.trigger.trim().is_empty() {
            None
        } else {
            Some(
                Regex::new(&format!("(?i){}", config.trigger)).map_err(|e| {
                    HealerError::InvalidConfig {
                        field: "formatGuard.trigger".into(),
                        reason: e.to_string(),
                    }
                })?,
            )
        };
        Ok(Self {
            trigger,
            check: config.check.clone(),
            write: config.write.clone(),
            exclude: build_globset(&config.exclude_paths)?,
        })
    }

    fn matches(&self, command: &str) -> bool {
        !self.check.is_empty()
            && self
                .trigger
                .as_ref()
                .is_some_and(|re| re.is_match(command.trim()))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| HealerError::InvalidConfig {
            field: "formatGuard.excludePaths".into(),
            reason: format!("{pattern}: {e}"),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| HealerError::InvalidConfig {
        field: "formatGuard.excludePaths".into(),
        reason: e.to_string(),
    })
}

/// Paths from `git status --porcelain`, rename targets resolved, excluded
/// paths removed, duplicates dropped.
pub fn parse_status_paths(porcelain: &str, exclude: &GlobSet) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for line in porcelain.lines() {
        if line.len() < 4 {
            continue;
        }
        let Some(rest) = line.get(3..) else {
            continue;
        };
        let target = match rest.rsplit_once(" -> ") {
            Some((_, to)) => to,
            None => rest,
        };
        let path = target.trim().trim_matches('"').to_string();
        if path.is_empty() || exclude.is_match(&path) || paths.contains(&path) {
            continue;
        }
        paths.push(path);
    }
    paths
}

impl PostFixRunner {
    pub fn new(
        git: Arc<dyn GitRunner>,
        commands: Vec<String>,
        allowlist: Vec<String>,
        format_guard: &FormatGuardConfig,
    ) -> Result<Self> {
        Ok(Self {
            git,
            commands,
            allowlist,
            guard: FormatGuard::new(format_guard)?,
        })
    }

    /// An empty allowlist admits every command.
    pub fn is_allowed(&self, command: &str) -> bool {
        self.allowlist.is_empty() || self.allowlist.iter().any(|a| a.trim() == command.trim())
    }

    /// Run every configured command in `cwd`, stopping at the first failure.
    pub async fn run(&self, cwd: &Path, log: &FixLog) -> Result<()> {
        if self.commands.is_empty() {
            return Ok(());
        }
        if let Some(blocked) = self.commands.iter().find(|c| !self.is_allowed(c)) {
            log.line(format!("[post-fix] blocked by allowlist: {blocked}"));
            return Err(HealerError::CommandNotAllowed {
                command: blocked.clone(),
            });
        }

        for command in &self.commands {
            if self.guard.matches(command) {
                self.run_format_guard(cwd, command, log).await?;
            } else {
                log.line(format!("[post-fix] $ {command}"));
                let out = run_logged(shell_command(command, cwd), log).await?;
                check_output(command, &out)?;
            }
        }
        info!("Post-fix commands passed in {}", cwd.display());
        Ok(())
    }

    async fn run_format_guard(&self, cwd: &Path, label: &str, log: &FixLog) -> Result<()> {
        let status = self
            .git
            .run(cwd, &["status", "--porcelain"], None)
            .await?;
        let changed = parse_status_paths(&status.stdout, &self.guard.exclude);
        if changed.is_empty() {
            log.line(format!("[post-fix] {label}: no changed files to check, skipping"));
            return Ok(());
        }

        log.line(format!(
            "[post-fix] {label}: checking {} changed file(s)",
            changed.len()
        ));
        let out = run_logged(argv_command(&self.guard.check, &changed, cwd), log).await?;
        if out.success() {
            return Ok(());
        }

        if self.guard.write.is_empty() {
            return check_output(label, &out);
        }
        warn!("Format check failed; writing formatting and re-checking");
        log.line(format!("[post-fix] {label}: formatting changed files"));
        let write = run_logged(argv_command(&self.guard.write, &changed, cwd), log).await?;
        check_output(label, &write)?;

        let recheck = run_logged(argv_command(&self.guard.check, &changed, cwd), log).await?;
        check_output(label, &recheck)
    }
}

fn argv_command(argv: &[String], paths: &[String], cwd: &Path) -> Command {
    let program = argv.first().map(String::as_str).unwrap_or_default();
    let mut cmd = Command::new(program);
    cmd.args(&argv[1.min(argv.len())..]).args(paths).current_dir(cwd);
    cmd
}

async fn run_logged(cmd: Command, log: &FixLog) -> Result<CommandOutput> {
    let out = run_streaming(cmd, None, None, |event| match event {
        ProcessEvent::Stdout(chunk) | ProcessEvent::Stderr(chunk) => log.append(chunk),
        ProcessEvent::Tick => {}
    })
    .await?;
    log.line(format!("[post-fix] exit code {}", out.code));
    Ok(out)
}

fn check_output(command: &str, out: &CommandOutput) -> Result<()> {
    if out.success() {
        return Ok(());
    }
    Err(HealerError::PostFixCheckFailed {
        command: command.to_string(),
        code: out.code,
        detail: out.describe_tails(FAILURE_TAIL_CHARS),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockGit;
    use tempfile::TempDir;

    fn excludes() -> GlobSet {
        build_globset(&FormatGuardConfig::default().exclude_paths).unwrap()
    }

    #[test]
    fn test_parse_status_paths() {
        let porcelain = " M src/a.ts\n?? src/new.ts\nR  src/old.ts -> src/renamed.ts\n M node_modules/x/index.js\n?? .healer/fix-logs/a.log\n M src/a.ts\n";
        assert_eq!(
            parse_status_paths(porcelain, &excludes()),
            vec!["src/a.ts", "src/new.ts", "src/renamed.ts"]
        );
    }

    #[test]
    fn test_trigger_matches_format_check_only() {
        let guard = FormatGuard::new(&FormatGuardConfig::default()).unwrap();
        assert!(guard.matches("npm run format:check"));
        assert!(guard.matches("npm  run format:check -- --cache"));
        assert!(!guard.matches("npm run format:checkall"));
        assert!(!guard.matches("npm test"));
    }

    #[tokio::test]
    async fn test_unlisted_command_is_blocked_before_anything_runs() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("ran");
        let first = format!("touch {}", marker.display());
        let runner = PostFixRunner::new(
            Arc::new(MockGit::new()),
            vec![first.clone(), "rm -rf build".into()],
            vec![first],
            &FormatGuardConfig::default(),
        )
        .unwrap();
        let log = FixLog::create(tmp.path().join("log")).unwrap();
        let err = runner.run(tmp.path(), &log).await.unwrap_err();
        assert!(matches!(err, HealerError::CommandNotAllowed { ref command } if command == "rm -rf build"));
        assert!(err.to_string().contains("blocked by allowlist"));
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_allowlist_admits_every_command() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("ran");
        let runner = PostFixRunner::new(
            Arc::new(MockGit::new()),
            vec!["true".into(), format!("touch {}", marker.display())],
            Vec::new(),
            &FormatGuardConfig::default(),
        )
        .unwrap();
        assert!(runner.is_allowed("anything at all"));
        let log = FixLog::create(tmp.path().join("log")).unwrap();
        runner.run(tmp.path(), &log).await.unwrap();
        assert!(marker.exists());
        assert!(!log.tail_lines(20).contains("blocked by allowlist"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_reports_exit_and_output() {
        let tmp = TempDir::new().unwrap();
        let cmd = "echo 'lint: 2 problems' >&2; exit 2".to_string();
        let runner = PostFixRunner::new(
            Arc::new(MockGit::new()),
            vec![cmd.clone()],
            vec![cmd.clone()],
            &FormatGuardConfig::default(),
        )
        .unwrap();
        let log = FixLog::create(tmp.path().join("log")).unwrap();
        let err = runner.run(tmp.path(), &log).await.unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with(&format!("post-fix command failed: {cmd}")));
        assert!(text.contains("exit: 2"));
        assert!(text.contains("lint: 2 problems"));
        assert!(log.tail_lines(5).contains("lint: 2 problems"));
    }

    #[tokio::test]
    async fn test_format_guard_skips_when_nothing_changed() {
        let tmp = TempDir::new().unwrap();
        let git = Arc::new(MockGit::new().with_response(
            &["status", "--porcelain"],
            crate::process::CommandOutput::ok(" M .healer/x.log\n"),
        ));
        let runner = PostFixRunner::new(
            git,
            vec!["npm run format:check".into()],
            vec!["npm run format:check".into()],
            &FormatGuardConfig::default(),
        )
        .unwrap();
        let log = FixLog::create(tmp.path().join("log")).unwrap();
        runner.run(tmp.path(), &log).await.unwrap();
        assert!(log.tail_lines(1).contains("skipping"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_format_guard_writes_then_rechecks() {
        let tmp = TempDir::new().unwrap();
        // The check passes only once the write step has created the stamp.
        let stamp = tmp.path().join("formatted");
        let check = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("test -f {}", stamp.display()),
        ];
        let write = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("touch {}", stamp.display()),
        ];
        let guard = FormatGuardConfig {
            check,
            write,
            ..FormatGuardConfig::default()
        };
        let git = Arc::new(MockGit::new().with_response(
            &["status", "--porcelain"],
            crate::process::CommandOutput::ok(" M src/a.ts\n"),
        ));
        let runner = PostFixRunner::new(
            git,
            vec!["npm run format:check".into()],
            vec!["npm run format:check".into()],
            &guard,
        )
        .unwrap();
        let log = FixLog::create(tmp.path().join("log")).unwrap();
        runner.run(tmp.path(), &log).await.unwrap();
        assert!(stamp.exists());
    }
}
