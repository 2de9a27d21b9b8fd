//! Patch agent invocation.
//!
//! The agent is an external command: it reads the prompt on stdin and
//! prints a unified diff on stdout. Its stderr (progress, thinking) is
//! streamed into the fix log while it runs, and a heartbeat reports long
//! quiet stretches so a stuck agent is visible.

use crate::config::AgentConfig;
use crate::error::{HealerError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::fix_log::{ChunkWriter, FixLog};
use crate::issue::IssueId;
use crate::patch::{sanitize, validate, PatchValidation, SanitizedPatch};
use crate::process::{run_streaming, shell_command, CommandOutput, ProcessEvent};
use crate::state::StateDir;
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const TICK: Duration = Duration::from_millis(250);
const HEARTBEAT_REPORT_INTERVAL: Duration = Duration::from_secs(10);
const FAILURE_TAIL_CHARS: usize = 4000;

/// Output settings handed to the agent for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMode {
    pub explain_mode: String,
    pub stream_partial: bool,
    pub thinking_max_chars: u32,
    pub stream_max_chars: u32,
    pub heartbeat: bool,
}

impl AgentMode {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            explain_mode: config.explain_mode.clone(),
            stream_partial: config.stream_partial,
            thinking_max_chars: config.thinking_max_chars_clamped(),
            stream_max_chars: config.stream_max_chars_clamped(),
            heartbeat: config.heartbeat,
        }
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: &AgentOverrides) -> Self {
        if let Some(stream) = overrides.stream_partial {
            self.stream_partial = stream;
        }
        if let Some(mode) = &overrides.explain_mode {
            self.explain_mode = mode.clone();
        }
        self
    }
}

/// Per-attempt changes to [`AgentMode`] chosen after a failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOverrides {
    pub stream_partial: Option<bool>,
    pub explain_mode: Option<String>,
}

impl AgentOverrides {
    /// Plain, non-streaming output with no explanation.
    pub fn quiet() -> Self {
        Self {
            stream_partial: Some(false),
            explain_mode: Some("none".to_string()),
        }
    }
}

/// One request to the patch agent.
pub struct AgentRequest<'a> {
    pub prompt: &'a str,
    pub issue_id: &'a IssueId,
    pub attempt: u32,
    pub cwd: &'a Path,
    pub mode: &'a AgentMode,
    pub log: &'a FixLog,
}

/// Produces a diff for a prompt.
#[async_trait]
pub trait PatchAgent: Send + Sync {
    async fn generate(&self, request: AgentRequest<'_>) -> Result<CommandOutput>;
}

/// Heartbeat thresholds.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSettings {
    pub enabled: bool,
    pub quiet: Duration,
    pub log_quiet: Duration,
    pub log_interval: Duration,
}

impl HeartbeatSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            enabled: config.heartbeat,
            quiet: Duration::from_secs(config.heartbeat_quiet_secs),
            log_quiet: Duration::from_secs(config.heartbeat_log_quiet_secs),
            log_interval: Duration::from_secs(config.heartbeat_log_interval_secs),
        }
    }
}

/// What a heartbeat tick should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTick {
    pub elapsed: Duration,
    pub quiet: Duration,
    /// Also write a line to the fix log.
    pub log: bool,
}

/// Tracks output activity of a running agent.
#[derive(Debug)]
pub struct Heartbeat {
    settings: HeartbeatSettings,
    started: Instant,
    last_activity: Instant,
    last_reported: Option<Instant>,
    last_logged: Option<Instant>,
}

impl Heartbeat {
    pub fn new(settings: HeartbeatSettings, now: Instant) -> Self {
        Self {
            settings,
            started: now,
            last_activity: now,
            last_reported: None,
            last_logged: None,
        }
    }

    pub fn activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn on_tick(&mut self, now: Instant) -> Option<HeartbeatTick> {
        if !self.settings.enabled {
            return None;
        }
        let quiet = now.saturating_duration_since(self.last_activity);
        if quiet < self.settings.quiet {
            return None;
        }
        let due = self
            .last_reported
            .is_none_or(|t| now.saturating_duration_since(t) >= HEARTBEAT_REPORT_INTERVAL);
        if !due {
            return None;
        }
        self.last_reported = Some(now);

        let log = quiet >= self.settings.log_quiet
            && self
                .last_logged
                .is_none_or(|t| now.saturating_duration_since(t) >= self.settings.log_interval);
        if log {
            self.last_logged = Some(now);
        }
        Some(HeartbeatTick {
            elapsed: now.saturating_duration_since(self.started),
            quiet,
            log,
        })
    }
}

/// Look up `key` in `.env.local`, then `.env`, under `root`.
pub fn read_env_value(root: &Path, key: &str) -> Option<String> {
    let pattern = format!(
        r"(?m)^[ \t]*(?:export[ \t]+)?{}[ \t]*=[ \t]*(.+?)[ \t]*$",
        regex::escape(key)
    );
    let re = Regex::new(&pattern).ok()?;
    for name in [".env.local", ".env"] {
        let Ok(text) = std::fs::read_to_string(root.join(name)) else {
            continue;
        };
        let Some(caps) = re.captures(&text) else {
            continue;
        };
        let raw = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        let value = strip_quotes(raw);
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

fn strip_quotes(s: &str) -> &str {
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// [`PatchAgent`] that runs a configured shell command.
pub struct CommandPatchAgent {
    command: String,
    workspace_root: PathBuf,
    credential_key: String,
    heartbeat: HeartbeatSettings,
    events: EventBus,
}

impl CommandPatchAgent {
    pub fn new(config: &AgentConfig, workspace_root: impl Into<PathBuf>, events: EventBus) -> Self {
        Self {
            command: config.command.clone(),
            workspace_root: workspace_root.into(),
            credential_key: config.credential_key.clone(),
            heartbeat: HeartbeatSettings::from_config(config),
            events,
        }
    }

    fn attempt_env(&self, request: &AgentRequest<'_>) -> Vec<(String, String)> {
        let mode = request.mode;
        let mut env = vec![
            ("HEALER_ISSUE_ID".to_string(), request.issue_id.to_string()),
            ("HEALER_ATTEMPT".to_string(), request.attempt.to_string()),
            (
                "HEALER_AGENT_EXPLAIN_MODE".to_string(),
                mode.explain_mode.clone(),
            ),
            (
                "HEALER_AGENT_STREAM_PARTIAL".to_string(),
                if mode.stream_partial { "1" } else { "" }.to_string(),
            ),
            (
                "HEALER_AGENT_THINKING_MAX_CHARS".to_string(),
                mode.thinking_max_chars.to_string(),
            ),
            (
                "HEALER_AGENT_STREAM_MAX_CHARS".to_string(),
                mode.stream_max_chars.to_string(),
            ),
            (
                "HEALER_AGENT_HEARTBEAT".to_string(),
                if mode.heartbeat { "1" } else { "" }.to_string(),
            ),
            (
                "HEALER_WORKSPACE_ROOT".to_string(),
                self.workspace_root.display().to_string(),
            ),
        ];
        if !self.credential_key.is_empty() && std::env::var_os(&self.credential_key).is_none() {
            if let Some(value) = read_env_value(&self.workspace_root, &self.credential_key) {
                debug!("Injecting {} from workspace env file", self.credential_key);
                env.push((self.credential_key.clone(), value));
            }
        }
        env
    }
}

#[async_trait]
impl PatchAgent for CommandPatchAgent {
    async fn generate(&self, request: AgentRequest<'_>) -> Result<CommandOutput> {
        let mut cmd = shell_command(&self.command, request.cwd);
        cmd.envs(self.attempt_env(&request));

        let log = request.log;
        log.line(format!(
            "[agent] running: {} (explain={}, stream={})",
            self.command, request.mode.explain_mode, request.mode.stream_partial
        ));

        let mut writer = ChunkWriter::new(log.clone());
        let mut heartbeat = Heartbeat::new(self.heartbeat, Instant::now());
        let issue_id = request.issue_id.clone();

        let output = run_streaming(cmd, Some(request.prompt), Some(TICK), |event| match event {
            ProcessEvent::Stdout(_) => heartbeat.activity(Instant::now()),
            ProcessEvent::Stderr(chunk) => {
                heartbeat.activity(Instant::now());
                writer.write(chunk);
            }
            ProcessEvent::Tick => {
                let now = Instant::now();
                writer.poll(now);
                if let Some(tick) = heartbeat.on_tick(now) {
                    self.events.emit(PipelineEvent::Heartbeat {
                        id: issue_id.clone(),
                        elapsed_secs: tick.elapsed.as_secs(),
                        quiet_secs: tick.quiet.as_secs(),
                    });
                    if tick.log {
                        writer.flush();
                        log.line(format!(
                            "[still running] generating patch ({}s elapsed, quiet {}s)",
                            tick.elapsed.as_secs(),
                            tick.quiet.as_secs()
                        ));
                    }
                }
            }
        })
        .await
        .map_err(|e| HealerError::agent(format!("Failed to run patch command: {e}")))?;

        writer.flush();
        log.line(format!("[agent] exit code {}", output.code));
        Ok(output)
    }
}

/// A diff produced for one attempt, with its repair and check results.
#[derive(Debug, Clone)]
pub struct PatchArtifact {
    pub raw: String,
    pub sanitized: SanitizedPatch,
    pub validation: PatchValidation,
    pub path: PathBuf,
}

impl PatchArtifact {
    pub fn patch(&self) -> &str {
        &self.sanitized.patch
    }
}

/// Runs the agent, repairs its output and persists the patch artifacts.
pub struct PatchAgentRunner {
    agent: Arc<dyn PatchAgent>,
    state: StateDir,
}

impl PatchAgentRunner {
    pub fn new(agent: Arc<dyn PatchAgent>, state: StateDir) -> Self {
        Self { agent, state }
    }

    pub async fn produce(&self, request: AgentRequest<'_>) -> Result<PatchArtifact> {
        let issue_id = request.issue_id.clone();
        let attempt = request.attempt;
        let log = request.log;

        let output = self.agent.generate(request).await?;
        if !output.success() {
            return Err(HealerError::agent(format!(
                "Patch command failed: code {}{}",
                output.code,
                output.describe_tails(FAILURE_TAIL_CHARS)
            )));
        }

        let sanitized = sanitize(&output.stdout);
        if !sanitized.has_git_diff() {
            return Err(HealerError::agent(format!(
                "Patch output did not contain a git diff (expected 'diff --git'){}",
                output.describe_tails(FAILURE_TAIL_CHARS)
            )));
        }
        let validation = validate(&sanitized.patch);

        let id = issue_id.as_str();
        let path = self.state.patch_path(id, Some(attempt), false);
        self.state.write_artifact(&path, &sanitized.patch)?;
        self.state
            .write_artifact(&self.state.patch_path(id, None, false), &sanitized.patch)?;
        if sanitized.changed {
            self.state
                .write_artifact(&self.state.patch_path(id, Some(attempt), true), &output.stdout)?;
            log.line(format!("[patch] sanitized: {}", sanitized.summary()));
        }
        if !validation.ok {
            warn!(
                "Patch for {} has {} hunk count mismatch(es)",
                id,
                validation.errors.len()
            );
        }
        log.line(format!("[patch] saved {}", path.display()));
        info!("Patch generated for {} (attempt {})", id, attempt);

        Ok(PatchArtifact {
            raw: output.stdout,
            sanitized,
            validation,
            path,
        })
    }
}
