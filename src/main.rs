//! Healer - automated fix pipeline
//!
//! Command-line entry point: queue issues, drain them serially, and expose
//! the diff sanitizer and validator as standalone tools.

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Select};
use healer::agent::{AgentMode, AgentRequest, CommandPatchAgent, PatchAgentRunner};
use healer::clock::SystemClock;
use healer::config::{ConfigSeverity, ReintegrationStrategy};
use healer::events::EventBus;
use healer::fix_log::{read_tail_lines, FixLog};
use healer::ledger::Ledger;
use healer::process::{run_captured, shell_command};
use healer::queue::{IssueQueue, QueueSummary};
use healer::rerun::prepare_rerun;
use healer::state::StateDir;
use healer::worktree::WorktreeManager;
use healer::{
    sanitize, validate, FixPipeline, GitCli, HealerConfig, HealerError, HumanDecider,
    HumanDecision, Issue, IssueId, IssueKind, IssueSubmission, PipelineContext, QueueHandle,
};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

mod progress;

use crate::progress::ProgressReporter;

#[derive(Parser)]
#[command(name = "healer")]
#[command(version)]
#[command(about = "Automated fix pipeline: agent-written patches applied and verified in isolated git worktrees", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Workspace directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Commands,
}

/// Flags that override `.healer/settings.json`.
#[derive(Args, Debug, Default)]
struct ConfigOverrides {
    /// Patch agent shell command
    #[arg(long, global = true, env = "HEALER_AGENT_COMMAND", value_name = "CMD")]
    agent_command: Option<String>,

    /// Maximum attempts per issue
    #[arg(long, global = true, value_name = "N")]
    max_attempts: Option<u32>,

    /// Run fixes directly in the workspace instead of a worktree
    #[arg(long, global = true)]
    no_worktrees: bool,

    /// Do not commit fixes
    #[arg(long, global = true)]
    no_commit: bool,

    /// Do not push fix branches
    #[arg(long, global = true)]
    no_push: bool,

    /// How a fix is brought back into the workspace
    #[arg(long, global = true, value_enum, value_name = "STRATEGY")]
    reintegration: Option<StrategyArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    StashAndPop,
    SkipIfDirty,
    NewBranch,
    Off,
}

impl From<StrategyArg> for ReintegrationStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::StashAndPop => Self::StashAndPop,
            StrategyArg::SkipIfDirty => Self::SkipIfDirty,
            StrategyArg::NewBranch => Self::NewBranch,
            StrategyArg::Off => Self::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Runtime,
    ManualUi,
}

impl From<KindArg> for IssueKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Runtime => Self::Runtime,
            KindArg::ManualUi => Self::ManualUi,
        }
    }
}

/// What happens when an issue is given up on.
#[derive(Args, Debug, Default, Clone)]
struct DecisionArgs {
    /// Ask on the terminal instead of skipping failed issues
    #[arg(long)]
    interactive: bool,

    /// Command that logs the patch agent in after an authentication failure
    #[arg(long, env = "HEALER_LOGIN_COMMAND", value_name = "CMD")]
    login_command: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fix one issue
    Fix {
        /// Issue title
        #[arg(short, long)]
        title: String,

        /// Error excerpt; the repair prompt is built from it
        #[arg(long, required_unless_present = "prompt_file", conflicts_with = "prompt_file")]
        excerpt: Option<String>,

        /// File holding a complete prompt
        #[arg(long, value_name = "FILE")]
        prompt_file: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "runtime")]
        kind: KindArg,

        #[arg(long, default_value = "cli")]
        source: String,

        /// Deduplication signature (derived from the text when omitted)
        #[arg(long)]
        signature: Option<String>,

        #[command(flatten)]
        decisions: DecisionArgs,
    },

    /// Read newline-delimited issue JSON from stdin and fix serially
    Serve {
        #[command(flatten)]
        decisions: DecisionArgs,
    },

    /// Rerun the last issue from its saved prompt
    Rerun {
        #[command(flatten)]
        decisions: DecisionArgs,
    },

    /// Repair a unified diff and print it
    Sanitize {
        /// Diff file (stdin when omitted)
        file: Option<PathBuf>,
    },

    /// Check hunk counts of a unified diff
    Validate {
        /// Diff file (stdin when omitted)
        file: Option<PathBuf>,
    },

    /// Run only the patch agent and print its diff
    Generate {
        #[arg(long, value_name = "FILE")]
        prompt_file: PathBuf,
    },

    /// Remove failed worktrees beyond the retention count
    Cleanup,

    /// Show effective configuration
    Config {
        /// Report configuration problems instead
        #[arg(long)]
        validate: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "healer=debug,info"
    } else {
        "healer=info,warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());
    if !project_path.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(1);
    }

    match run(cli, &project_path).await {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            if let HealerError::AuthenticationRequired { .. } = e {
                eprintln!(
                    "  Log the patch agent in (or set its API key in .env.local) and run {}.",
                    "healer rerun".bold()
                );
            }
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli, root: &Path) -> healer::Result<i32> {
    let load_config = || -> healer::Result<HealerConfig> {
        let mut config = HealerConfig::load(root)?;
        apply_overrides(&mut config, &cli.overrides);
        Ok(config)
    };

    match cli.command {
        Commands::Fix {
            title,
            excerpt,
            prompt_file,
            kind,
            source,
            signature,
            decisions,
        } => {
            let mut issue = Issue::new(title, source, kind.into());
            if let Some(sig) = signature {
                issue = issue.with_signature(sig);
            }
            issue = match (excerpt, prompt_file) {
                (Some(excerpt), _) => issue.with_excerpt(excerpt),
                (None, Some(file)) => issue.with_prompt_text(std::fs::read_to_string(file)?),
                (None, None) => {
                    return Err(HealerError::InvalidConfig {
                        field: "fix".into(),
                        reason: "one of --excerpt or --prompt-file is required".into(),
                    })
                }
            };
            let summary = drain(root, load_config()?, &decisions, vec![issue]).await?;
            Ok(report_summary(&summary))
        }

        Commands::Serve { decisions } => {
            let config = load_config()?;
            let events = EventBus::default();
            let pipeline = build_pipeline(root, config.clone(), &events)?;
            let decider = Arc::new(CliDecider::new(root, &decisions));
            let queue = IssueQueue::new(
                pipeline,
                decider,
                Arc::new(SystemClock),
                StateDir::new(root),
                config.queue.clone(),
                events.clone(),
            )?;
            let (handle, rx) = QueueHandle::channel(64);
            let reporter = ProgressReporter::spawn(&events);

            let reader = tokio::spawn(async move {
                let mut lines = BufReader::new(tokio::io::stdin()).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<IssueSubmission>(&line) {
                        Ok(submission) => match submission.into_issue() {
                            Some(issue) => {
                                if handle.submit(issue).await.is_err() {
                                    break;
                                }
                            }
                            None => eprintln!(
                                "{} issue needs an excerpt or promptText",
                                "Warning:".yellow()
                            ),
                        },
                        Err(e) => eprintln!("{} invalid issue JSON: {}", "Warning:".yellow(), e),
                    }
                }
            });

            let summary = queue.run(rx).await;
            let _ = reader.await;
            reporter.stop();
            Ok(report_summary(&summary))
        }

        Commands::Rerun { decisions } => {
            let state = StateDir::new(root);
            let ledger = Ledger::new(state.ledger_path());
            let issue = prepare_rerun(&state, &ledger, &SystemClock)?;
            println!(
                "{} rerun queued: {} (from {})",
                "OK".green().bold(),
                issue.id,
                issue
                    .rerun_of
                    .as_ref()
                    .map(IssueId::as_str)
                    .unwrap_or_default()
            );
            let summary = drain(root, load_config()?, &decisions, vec![issue]).await?;
            Ok(report_summary(&summary))
        }

        Commands::Sanitize { file } => {
            let input = read_input(file.as_deref())?;
            let sanitized = sanitize(&input);
            if sanitized.changed {
                eprintln!("{} {}", "sanitized:".yellow(), sanitized.summary());
            }
            print!("{}", sanitized.patch);
            Ok(0)
        }

        Commands::Validate { file } => {
            let input = read_input(file.as_deref())?;
            let validation = validate(&input);
            if validation.ok {
                println!(
                    "{} {} hunk(s) match their headers",
                    "OK".green().bold(),
                    validation.hunks.len()
                );
                return Ok(0);
            }
            for error in &validation.errors {
                println!("{} {}", "Mismatch:".red(), error);
            }
            Ok(1)
        }

        Commands::Generate { prompt_file } => {
            let config = load_config()?;
            config.ensure_valid()?;
            let prompt = std::fs::read_to_string(&prompt_file)?;
            let state = StateDir::new(root);
            state.ensure()?;

            let id = IssueId::generate(chrono::Utc::now());
            let log = FixLog::create(state.fix_log_path(id.as_str()))?;
            let agent = CommandPatchAgent::new(&config.agent, root, EventBus::default());
            let runner = PatchAgentRunner::new(Arc::new(agent), state);
            let mode = AgentMode::from_config(&config.agent);
            let artifact = runner
                .produce(AgentRequest {
                    prompt: &prompt,
                    issue_id: &id,
                    attempt: 1,
                    cwd: root,
                    mode: &mode,
                    log: &log,
                })
                .await?;
            if !artifact.validation.ok {
                for error in &artifact.validation.errors {
                    eprintln!("{} {}", "Warning:".yellow(), error);
                }
            }
            eprintln!("{} {}", "saved".dimmed(), artifact.path.display());
            print!("{}", artifact.patch());
            Ok(0)
        }

        Commands::Cleanup => {
            let config = load_config()?;
            let git = GitCli::new();
            git.ensure_available()?;
            let manager = WorktreeManager::new(Arc::new(git), StateDir::new(root));
            let removed = manager
                .prune_failed(config.worktree_retain_on_failure, &HashSet::new(), None)
                .await?;
            for path in &removed {
                println!("{} {}", "removed".yellow(), path.display());
            }
            println!(
                "{} {} failed worktree(s) removed",
                "OK".green().bold(),
                removed.len()
            );
            Ok(0)
        }

        Commands::Config { validate } => {
            let config = load_config()?;
            if !validate {
                println!("{}", serde_json::to_string_pretty(&config)?);
                return Ok(0);
            }
            let issues = config.validate();
            if issues.is_empty() {
                println!("{} configuration is valid", "OK".green().bold());
                return Ok(0);
            }
            let mut errors = 0;
            for issue in &issues {
                match issue.severity {
                    ConfigSeverity::Error => {
                        errors += 1;
                        println!("{} {}: {}", "Error:".red().bold(), issue.field, issue.message);
                    }
                    ConfigSeverity::Warning => {
                        println!("{} {}: {}", "Warning:".yellow(), issue.field, issue.message);
                    }
                }
            }
            Ok(if errors > 0 { 1 } else { 0 })
        }
    }
}

fn apply_overrides(config: &mut HealerConfig, overrides: &ConfigOverrides) {
    if let Some(command) = &overrides.agent_command {
        config.agent.command = command.clone();
    }
    if let Some(n) = overrides.max_attempts {
        config.max_attempts_per_issue = n;
    }
    if overrides.no_worktrees {
        config.use_worktrees = false;
    }
    if overrides.no_commit {
        config.auto_commit = false;
    }
    if overrides.no_push {
        config.auto_push = false;
    }
    if let Some(strategy) = overrides.reintegration {
        config.reintegration.strategy = strategy.into();
    }
}

fn read_input(file: Option<&Path>) -> healer::Result<String> {
    match file {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

fn build_pipeline(
    root: &Path,
    config: HealerConfig,
    events: &EventBus,
) -> healer::Result<FixPipeline> {
    let git = GitCli::new();
    git.ensure_available()?;
    let agent = CommandPatchAgent::new(&config.agent, root, events.clone());
    let ctx = PipelineContext::new(root, config, Arc::new(git), Arc::new(agent))
        .with_events(events.clone());
    FixPipeline::new(ctx)
}

/// Queue `issues` and fix them all.
async fn drain(
    root: &Path,
    config: HealerConfig,
    decisions: &DecisionArgs,
    issues: Vec<Issue>,
) -> healer::Result<QueueSummary> {
    let events = EventBus::default();
    let pipeline = build_pipeline(root, config.clone(), &events)?;
    let mut queue = IssueQueue::new(
        pipeline,
        Arc::new(CliDecider::new(root, decisions)),
        Arc::new(SystemClock),
        StateDir::new(root),
        config.queue.clone(),
        events.clone(),
    )?;
    let reporter = ProgressReporter::spawn(&events);
    for issue in issues {
        queue.enqueue(issue);
    }
    let summary = queue.run_until_idle().await;
    reporter.stop();
    Ok(summary)
}

fn report_summary(summary: &QueueSummary) -> i32 {
    println!(
        "{} fixed, {} failed, {} dropped",
        summary.succeeded.len().to_string().green().bold(),
        summary.failed.len().to_string().red().bold(),
        summary.dropped
    );
    i32::from(!summary.failed.is_empty())
}

/// Decides from the terminal, or automatically when not interactive.
struct CliDecider {
    root: PathBuf,
    interactive: bool,
    login_command: Option<String>,
}

impl CliDecider {
    fn new(root: &Path, args: &DecisionArgs) -> Self {
        Self {
            root: root.to_path_buf(),
            interactive: args.interactive,
            login_command: args.login_command.clone(),
        }
    }

    /// Run the login command; `Login` on success, `Skip` otherwise.
    async fn login(&self) -> HumanDecision {
        let Some(command) = &self.login_command else {
            eprintln!(
                "{} no --login-command configured; skipping",
                "Warning:".yellow()
            );
            return HumanDecision::Skip;
        };
        eprintln!("{} {}", "Running login:".cyan(), command);
        match run_captured(shell_command(command, &self.root), None).await {
            Ok(out) if out.success() => HumanDecision::Login,
            Ok(out) => {
                eprintln!(
                    "{} login command exited {}{}",
                    "Error:".red().bold(),
                    out.code,
                    out.describe_tails(2000)
                );
                HumanDecision::Skip
            }
            Err(e) => {
                eprintln!("{} login command failed: {}", "Error:".red().bold(), e);
                HumanDecision::Skip
            }
        }
    }

    async fn ask(&self) -> HumanDecision {
        let picked = tokio::task::spawn_blocking(|| {
            Select::with_theme(&ColorfulTheme::default())
                .with_prompt("What next?")
                .items(&DECISION_LABELS)
                .default(0)
                .interact()
        })
        .await;
        match picked {
            Ok(Ok(index)) => decision_at(index),
            Ok(Err(e)) => {
                eprintln!("{} prompt failed: {}", "Warning:".yellow(), e);
                HumanDecision::Skip
            }
            Err(_) => HumanDecision::Skip,
        }
    }
}

const DECISION_LABELS: [&str; 4] = ["Retry", "Skip", "Open log", "Login"];

fn decision_at(index: usize) -> HumanDecision {
    match index {
        0 => HumanDecision::Retry,
        2 => HumanDecision::OpenLog,
        3 => HumanDecision::Login,
        _ => HumanDecision::Skip,
    }
}

#[async_trait]
impl HumanDecider for CliDecider {
    async fn decide(&self, issue: &Issue, error: &HealerError, log_path: &Path) -> HumanDecision {
        eprintln!(
            "{} {} ({}): {}",
            "Fix failed:".red().bold(),
            issue.id,
            error.kind(),
            error.to_string().lines().next().unwrap_or_default()
        );
        eprintln!("  log: {}", log_path.display());

        if !self.interactive {
            return if error.kind() == healer::ErrorKind::AuthenticationRequired {
                self.login().await
            } else {
                HumanDecision::Skip
            };
        }

        match self.ask().await {
            HumanDecision::OpenLog => {
                eprintln!("{}", read_tail_lines(log_path, 60));
                HumanDecision::OpenLog
            }
            HumanDecision::Login => self.login().await,
            decision => decision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_labels_map_to_decisions() {
        let decisions: Vec<HumanDecision> = (0..DECISION_LABELS.len()).map(decision_at).collect();
        assert_eq!(
            decisions,
            vec![
                HumanDecision::Retry,
                HumanDecision::Skip,
                HumanDecision::OpenLog,
                HumanDecision::Login,
            ]
        );
        assert_eq!(decision_at(DECISION_LABELS.len()), HumanDecision::Skip);
    }
}
