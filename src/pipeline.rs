//! One issue, end to end.
//!
//! ```text
//! preflight ─> worktree ─> AttemptController ─┬─> [result] ─> retention
//!                               │             │
//!                               ▼             │
//!        reset ─> prompt ─> agent ─> apply ─> post-fix ─> commit ─> reintegrate
//! ```

use crate::agent::{AgentMode, AgentRequest, PatchAgent, PatchAgentRunner};
use crate::apply::PatchApplier;
use crate::classify::Classification;
use crate::clock::{Clock, SystemClock};
use crate::commit::{CommitPublisher, CommitResult};
use crate::config::HealerConfig;
use crate::controller::{AttemptController, AttemptExecutor, AttemptPlan, ControllerOutcome};
use crate::error::{HealerError, Result};
use crate::events::{EventBus, PipelineEvent, Stage};
use crate::fix_log::FixLog;
use crate::git::{current_branch, head_sha, GitRunner};
use crate::issue::Issue;
use crate::ledger::{IssueOutcome, Ledger, LedgerEvent};
use crate::postfix::PostFixRunner;
use crate::prompt::{join_prompt_parts, PromptBuilder};
use crate::reintegrate::{ReintegrationResult, WorkspaceReintegrator};
use crate::state::{slug, StateDir};
use crate::worktree::{RetentionPolicy, Worktree, WorktreeManager};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Everything a pipeline run needs, constructed once per workspace.
pub struct PipelineContext {
    pub config: HealerConfig,
    pub state: StateDir,
    pub git: Arc<dyn GitRunner>,
    pub agent: Arc<dyn PatchAgent>,
    pub events: EventBus,
    pub ledger: Ledger,
    pub clock: Arc<dyn Clock>,
}

impl PipelineContext {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        config: HealerConfig,
        git: Arc<dyn GitRunner>,
        agent: Arc<dyn PatchAgent>,
    ) -> Self {
        let state = StateDir::new(workspace_root);
        let ledger = Ledger::new(state.ledger_path());
        Self {
            config,
            state,
            git,
            agent,
            events: EventBus::default(),
            ledger,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn workspace_root(&self) -> &Path {
        self.state.workspace_root()
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            retain_on_success: self.config.worktree_retain_on_success,
            retain_on_failure: self.config.worktree_retain_on_failure,
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub issue_id: String,
    pub attempts: u32,
    pub branch: String,
    pub workdir: PathBuf,
    pub commit: Option<CommitResult>,
    pub reintegration: Option<ReintegrationResult>,
    pub log_path: PathBuf,
}

/// What a successful attempt produced.
#[derive(Debug, Clone)]
pub struct AttemptSuccess {
    pub commit: Option<CommitResult>,
    pub reintegration: Option<ReintegrationResult>,
}

pub struct FixPipeline {
    ctx: PipelineContext,
    worktrees: WorktreeManager,
    agent: PatchAgentRunner,
    applier: PatchApplier,
    postfix: PostFixRunner,
    publisher: CommitPublisher,
    reintegrator: WorkspaceReintegrator,
    prompts: PromptBuilder,
}

impl FixPipeline {
    /// Build the stages. Invalid configuration is rejected here.
    pub fn new(ctx: PipelineContext) -> Result<Self> {
        ctx.config.ensure_valid()?;
        let cfg = &ctx.config;
        let git = ctx.git.clone();
        Ok(Self {
            worktrees: WorktreeManager::new(git.clone(), ctx.state.clone()),
            agent: PatchAgentRunner::new(ctx.agent.clone(), ctx.state.clone()),
            applier: PatchApplier::new(git.clone()),
            postfix: PostFixRunner::new(
                git.clone(),
                cfg.post_fix_commands.clone(),
                cfg.post_fix_commands_allowlist.clone(),
                &cfg.format_guard,
            )?,
            publisher: CommitPublisher::new(
                git.clone(),
                cfg.auto_commit,
                cfg.auto_push,
                cfg.remote_name.clone(),
                cfg.commit_message_template.clone(),
            ),
            reintegrator: WorkspaceReintegrator::new(
                git.clone(),
                ctx.state.workspace_root(),
                cfg.reintegration.clone(),
                cfg.branch_prefix.clone(),
            ),
            prompts: PromptBuilder::new(git),
            ctx,
        })
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    fn emit_stage(&self, issue: &Issue, stage: Stage) {
        self.ctx.events.emit(PipelineEvent::Stage {
            id: issue.id.clone(),
            stage,
        });
    }

    /// Run every attempt for `issue`. `Err` carries the last attempt's
    /// error once the issue has been given up on.
    pub async fn run_issue(&self, issue: &Issue) -> Result<PipelineReport> {
        let ctx = &self.ctx;
        let cfg = &ctx.config;
        let root = ctx.workspace_root();
        let id = issue.id.as_str();
        ctx.state.ensure()?;

        let base_ref = head_sha(ctx.git.as_ref(), root).await?;
        let branch = if cfg.use_worktrees {
            format!("{}{}", cfg.branch_prefix, slug(id))
        } else {
            current_branch(ctx.git.as_ref(), root).await?
        };

        let log = FixLog::create(ctx.state.fix_log_path(id))?;
        log.line("=== Healer Fix Start ===");
        log.line(format!("Title: {}", issue.title));
        log.line(format!("Issue: {id}"));
        log.line(format!("Source: {}", issue.source));
        log.line(format!("Signature: {}", issue.signature));
        log.line(format!("Max attempts (per issue): {}", cfg.max_attempts_per_issue));
        log.line(format!("Base ref: {base_ref}"));
        log.line(format!("Branch: {branch}"));
        log.line(format!(
            "Worktrees: {}",
            if cfg.use_worktrees { "enabled" } else { "disabled" }
        ));
        log.line(format!("Started: {}", ctx.clock.now().to_rfc3339()));
        log.line("");
        info!("Fixing {} ({}) on {}", id, issue.title, branch);

        let worktree = if cfg.use_worktrees {
            self.emit_stage(issue, Stage::Worktree);
            match self.worktrees.ensure(id, &base_ref, &branch).await {
                Ok(wt) => {
                    log.line(format!("Workdir: {}", wt.path.display()));
                    Some(wt)
                }
                Err(e) => {
                    let err = match e {
                        HealerError::WorktreeSetupFailed { .. } => e,
                        other => HealerError::worktree(ctx.state.worktree_path(id), other.to_string()),
                    };
                    log.line(format!("[error] {err}"));
                    self.finish(issue, &log, false, &err.to_string());
                    return Err(err);
                }
            }
        } else {
            log.line(format!("Workdir: {}", root.display()));
            None
        };
        let workdir = worktree
            .as_ref()
            .map_or_else(|| root.to_path_buf(), |wt| wt.path.clone());

        let executor = IssueAttempt {
            pipeline: self,
            issue,
            workdir: &workdir,
            worktree: worktree.as_ref(),
            base_ref: &base_ref,
            branch: &branch,
            log: &log,
        };
        let mut controller = AttemptController::new(executor, cfg.max_attempts_per_issue, &log)
            .with_events(ctx.events.clone(), issue.id.clone());
        let outcome = controller.run().await;

        let result = match outcome {
            ControllerOutcome::Succeeded { attempt, output } => {
                self.finish(issue, &log, true, "");
                self.ctx.events.emit(PipelineEvent::Succeeded {
                    id: issue.id.clone(),
                    sha: output.commit.as_ref().map(|c| c.committed_sha.clone()),
                });
                Ok(PipelineReport {
                    issue_id: id.to_string(),
                    attempts: attempt,
                    branch,
                    workdir: workdir.clone(),
                    commit: output.commit,
                    reintegration: output.reintegration,
                    log_path: log.path().to_path_buf(),
                })
            }
            ControllerOutcome::Aborted {
                attempts, error, ..
            } => {
                error!("Fix for {} failed after {} attempt(s)", id, attempts);
                self.finish(issue, &log, false, &error.to_string());
                Err(error)
            }
        };

        if let Some(wt) = &worktree {
            if cfg.cleanup_worktrees {
                if let Err(e) = self
                    .worktrees
                    .apply_retention(&wt.path, result.is_ok(), ctx.retention_policy(), &log)
                    .await
                {
                    warn!("Worktree retention failed for {}: {}", id, e);
                    log.line(format!("[warn] worktree cleanup failed: {e}"));
                }
            }
        }
        result
    }

    fn finish(&self, issue: &Issue, log: &FixLog, succeeded: bool, message: &str) {
        log.line("");
        log.line("=== Healer Fix End ===");
        log.line(format!(
            "[result] {}",
            if succeeded { "success" } else { "failed" }
        ));
        self.ctx.ledger.record(&LedgerEvent::IssueFinished {
            id: issue.id.clone(),
            at: self.ctx.clock.now(),
            outcome: if succeeded {
                IssueOutcome::Success
            } else {
                IssueOutcome::Failed
            },
        });
        if !succeeded {
            self.ctx.events.emit(PipelineEvent::Failed {
                id: issue.id.clone(),
                message: message.lines().next().unwrap_or_default().to_string(),
            });
        }
    }
}

/// The stages of one attempt, bound to a single issue.
struct IssueAttempt<'a> {
    pipeline: &'a FixPipeline,
    issue: &'a Issue,
    workdir: &'a Path,
    worktree: Option<&'a Worktree>,
    base_ref: &'a str,
    branch: &'a str,
    log: &'a FixLog,
}

impl IssueAttempt<'_> {
    async fn build_prompt(&self, plan: &AttemptPlan) -> Result<String> {
        let p = self.pipeline;
        let base = PromptBuilder::base_prompt(self.issue, self.workdir);
        p.ctx
            .state
            .write_artifact(&p.ctx.state.prompt_path(self.issue.id.as_str()), &base)?;

        let snapshot = p
            .prompts
            .repo_snapshot(self.workdir, &base, self.base_ref)
            .await;
        let hints = p.prompts.search_hints(self.workdir, &base).await;
        if !snapshot.is_empty() {
            self.log.line(format!(
                "[info] repo snapshot appended to agent prompt (attempt {})",
                plan.number
            ));
        }
        if !hints.is_empty() {
            self.log.line(format!(
                "[info] git grep hints appended to agent prompt (attempt {})",
                plan.number
            ));
        }
        Ok(join_prompt_parts(&[&base, &plan.guidance, &snapshot, &hints]))
    }
}

#[async_trait]
impl AttemptExecutor for IssueAttempt<'_> {
    type Output = AttemptSuccess;

    async fn execute(&self, plan: &AttemptPlan) -> Result<AttemptSuccess> {
        let p = self.pipeline;
        let ctx = &p.ctx;
        let id = &self.issue.id;
        ctx.ledger.record(&LedgerEvent::AttemptStart {
            id: id.clone(),
            at: ctx.clock.now(),
            attempt: plan.number,
            branch: self.branch.to_string(),
            base_ref: self.base_ref.to_string(),
        });

        if let Some(wt) = self.worktree {
            p.worktrees.reset(wt).await?;
        }
        let prompt = self.build_prompt(plan).await?;

        p.emit_stage(self.issue, Stage::Agent);
        let mode = AgentMode::from_config(&ctx.config.agent).with_overrides(&plan.agent_overrides);
        let artifact = p
            .agent
            .produce(AgentRequest {
                prompt: &prompt,
                issue_id: id,
                attempt: plan.number,
                cwd: self.workdir,
                mode: &mode,
                log: self.log,
            })
            .await?;

        p.emit_stage(self.issue, Stage::Apply);
        p.applier.apply(self.workdir, &artifact, self.log).await?;

        p.emit_stage(self.issue, Stage::PostFix);
        p.postfix.run(self.workdir, self.log).await?;

        p.emit_stage(self.issue, Stage::Commit);
        let commit = p
            .publisher
            .publish(self.workdir, self.issue, self.branch, self.log)
            .await?;

        let reintegration = match (self.worktree, &commit) {
            (Some(_), Some(c)) => {
                p.emit_stage(self.issue, Stage::Reintegrate);
                Some(
                    p.reintegrator
                        .reintegrate(Some(&c.committed_sha), id.as_str(), self.log)
                        .await,
                )
            }
            _ => None,
        };

        ctx.ledger.record(&LedgerEvent::Pushed {
            id: id.clone(),
            at: ctx.clock.now(),
            attempt: plan.number,
            branch: self.branch.to_string(),
            sha: commit.as_ref().map(|c| c.committed_sha.clone()),
        });
        Ok(AttemptSuccess {
            commit,
            reintegration,
        })
    }

    async fn on_failure(
        &self,
        plan: &AttemptPlan,
        error: &HealerError,
        classification: &Classification,
    ) {
        let ctx = &self.pipeline.ctx;
        let id = self.issue.id.as_str();
        let message = error.to_string();
        ctx.ledger.record(&LedgerEvent::AttemptFailed {
            id: self.issue.id.clone(),
            at: ctx.clock.now(),
            attempt: plan.number,
            error: message.clone(),
            kind: classification.kind,
        });
        let detail = format!(
            "kind: {}\nnext: {}\n\n{message}\n\n{error:?}\n",
            classification.kind, classification.strategy
        );
        if let Err(e) = ctx
            .state
            .write_artifact(&ctx.state.attempt_error_path(id, plan.number), &detail)
        {
            warn!("Failed to write attempt error for {}: {}", id, e);
        }
    }

    fn log_tail(&self, lines: usize) -> String {
        self.log.tail_lines(lines)
    }
}
