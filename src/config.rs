//! Configuration loading and validation.
//!
//! Settings live in `.healer/settings.json` (camelCase keys). A missing file
//! means defaults; a present file only needs the keys it overrides.

use crate::error::{HealerError, Result};
use crate::state::StateDir;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealerConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_issue: u32,

    #[serde(default = "default_true")]
    pub use_worktrees: bool,

    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,

    #[serde(default = "default_remote")]
    pub remote_name: String,

    #[serde(default = "default_true")]
    pub auto_commit: bool,

    #[serde(default = "default_true")]
    pub auto_push: bool,

    #[serde(default = "default_commit_template")]
    pub commit_message_template: String,

    #[serde(default = "default_true")]
    pub cleanup_worktrees: bool,

    #[serde(default)]
    pub worktree_retain_on_success: usize,

    #[serde(default = "default_retain_on_failure")]
    pub worktree_retain_on_failure: usize,

    #[serde(default)]
    pub post_fix_commands: Vec<String>,

    #[serde(default)]
    pub post_fix_commands_allowlist: Vec<String>,

    #[serde(default)]
    pub format_guard: FormatGuardConfig,

    #[serde(default)]
    pub reintegration: ReintegrationConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_branch_prefix() -> String {
    "healer/".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_commit_template() -> String {
    "Healer: {title} ({id})".to_string()
}

fn default_retain_on_failure() -> usize {
    2
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_issue: default_max_attempts(),
            use_worktrees: true,
            branch_prefix: default_branch_prefix(),
            remote_name: default_remote(),
            auto_commit: true,
            auto_push: true,
            commit_message_template: default_commit_template(),
            cleanup_worktrees: true,
            worktree_retain_on_success: 0,
            worktree_retain_on_failure: default_retain_on_failure(),
            post_fix_commands: Vec::new(),
            post_fix_commands_allowlist: Vec::new(),
            format_guard: FormatGuardConfig::default(),
            reintegration: ReintegrationConfig::default(),
            agent: AgentConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

/// Scopes a formatting check to the files the fix touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatGuardConfig {
    /// Regex matched against each post-fix command.
    #[serde(default = "default_format_trigger")]
    pub trigger: String,
    /// Check command; changed paths are appended.
    #[serde(default = "default_format_check")]
    pub check: Vec<String>,
    /// Write command; changed paths are appended.
    #[serde(default = "default_format_write")]
    pub write: Vec<String>,
    /// Globs of paths never handed to the formatter.
    #[serde(default = "default_format_excludes")]
    pub exclude_paths: Vec<String>,
}

fn default_format_trigger() -> String {
    r"^npm\s+run\s+format:check(\s|$)".to_string()
}

fn default_format_check() -> Vec<String> {
    ["npx", "--no-install", "prettier", "--check"]
        .map(String::from)
        .to_vec()
}

fn default_format_write() -> Vec<String> {
    ["npx", "--no-install", "prettier", "--write"]
        .map(String::from)
        .to_vec()
}

fn default_format_excludes() -> Vec<String> {
    [
        ".healer/**",
        "node_modules/**",
        "dist/**",
        "build/**",
        "target/**",
    ]
    .map(String::from)
    .to_vec()
}

impl Default for FormatGuardConfig {
    fn default() -> Self {
        Self {
            trigger: default_format_trigger(),
            check: default_format_check(),
            write: default_format_write(),
            exclude_paths: default_format_excludes(),
        }
    }
}

/// How a committed fix is brought back into the main workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ReintegrationStrategy {
    #[default]
    StashAndPop,
    SkipIfDirty,
    NewBranch,
    Off,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReintegrationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: ReintegrationStrategy,
}

impl Default for ReintegrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: ReintegrationStrategy::default(),
        }
    }
}

/// Patch agent subprocess settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Shell command that reads the prompt on stdin and prints a diff.
    #[serde(default)]
    pub command: String,
    #[serde(default = "default_explain_mode")]
    pub explain_mode: String,
    #[serde(default = "default_true")]
    pub stream_partial: bool,
    #[serde(default = "default_thinking_max_chars")]
    pub thinking_max_chars: u32,
    #[serde(default = "default_stream_max_chars")]
    pub stream_max_chars: u32,
    #[serde(default = "default_true")]
    pub heartbeat: bool,
    /// Environment variable injected from `.env.local`/`.env` if unset.
    #[serde(default = "default_credential_key")]
    pub credential_key: String,
    #[serde(default = "default_heartbeat_quiet")]
    pub heartbeat_quiet_secs: u64,
    #[serde(default = "default_heartbeat_log_quiet")]
    pub heartbeat_log_quiet_secs: u64,
    #[serde(default = "default_heartbeat_log_interval")]
    pub heartbeat_log_interval_secs: u64,
}

fn default_explain_mode() -> String {
    "summary".to_string()
}

fn default_thinking_max_chars() -> u32 {
    2500
}

fn default_stream_max_chars() -> u32 {
    20_000
}

fn default_credential_key() -> String {
    "CURSOR_API_KEY".to_string()
}

fn default_heartbeat_quiet() -> u64 {
    12
}

fn default_heartbeat_log_quiet() -> u64 {
    30
}

fn default_heartbeat_log_interval() -> u64 {
    60
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            explain_mode: default_explain_mode(),
            stream_partial: true,
            thinking_max_chars: default_thinking_max_chars(),
            stream_max_chars: default_stream_max_chars(),
            heartbeat: true,
            credential_key: default_credential_key(),
            heartbeat_quiet_secs: default_heartbeat_quiet(),
            heartbeat_log_quiet_secs: default_heartbeat_log_quiet(),
            heartbeat_log_interval_secs: default_heartbeat_log_interval(),
        }
    }
}

impl AgentConfig {
    pub fn thinking_max_chars_clamped(&self) -> u32 {
        self.thinking_max_chars.clamp(400, 20_000)
    }

    pub fn stream_max_chars_clamped(&self) -> u32 {
        self.stream_max_chars.clamp(1000, 200_000)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_signature_cooldown")]
    pub signature_cooldown_ms: u64,
    #[serde(default = "default_auth_resume_delay")]
    pub auth_resume_delay_ms: u64,
}

fn default_signature_cooldown() -> u64 {
    30_000
}

fn default_auth_resume_delay() -> u64 {
    15_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            signature_cooldown_ms: default_signature_cooldown(),
            auth_resume_delay_ms: default_auth_resume_delay(),
        }
    }
}

/// Severity of a configuration finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// One problem reported by [`HealerConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.to_string(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl HealerConfig {
    /// Load configuration for a workspace, falling back to defaults.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = StateDir::new(workspace_root).settings_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| HealerError::config_with_path(e.to_string(), path.clone()))
    }

    /// Report problems; errors make the pipeline refuse to start.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.max_attempts_per_issue == 0 {
            issues.push(ConfigIssue::error(
                "maxAttemptsPerIssue",
                "must be at least 1",
            ));
        }
        if self.agent.command.trim().is_empty() {
            issues.push(ConfigIssue::error(
                "agent.command",
                "no patch agent command configured",
            ));
        }
        if self.branch_prefix.contains(char::is_whitespace) {
            issues.push(ConfigIssue::error(
                "branchPrefix",
                "branch names cannot contain whitespace",
            ));
        }
        if self.remote_name.trim().is_empty() && self.auto_push {
            issues.push(ConfigIssue::error("remoteName", "autoPush needs a remote"));
        }
        if let Err(e) = regex::Regex::new(&self.format_guard.trigger) {
            issues.push(ConfigIssue::error("formatGuard.trigger", e.to_string()));
        }
        for pattern in &self.format_guard.exclude_paths {
            if let Err(e) = globset::Glob::new(pattern) {
                issues.push(ConfigIssue::error(
                    "formatGuard.excludePaths",
                    format!("{pattern}: {e}"),
                ));
            }
        }
        let allowlist = &self.post_fix_commands_allowlist;
        for command in &self.post_fix_commands {
            if !allowlist.is_empty() && !allowlist.iter().any(|a| a.trim() == command.trim()) {
                issues.push(ConfigIssue::warning(
                    "postFixCommandsAllowlist",
                    format!("'{command}' is not allowlisted and will block every fix"),
                ));
            }
        }
        if self.agent.thinking_max_chars != self.agent.thinking_max_chars_clamped() {
            issues.push(ConfigIssue::warning(
                "agent.thinkingMaxChars",
                format!("clamped to {}", self.agent.thinking_max_chars_clamped()),
            ));
        }
        if self.agent.stream_max_chars != self.agent.stream_max_chars_clamped() {
            issues.push(ConfigIssue::warning(
                "agent.streamMaxChars",
                format!("clamped to {}", self.agent.stream_max_chars_clamped()),
            ));
        }
        if !self.use_worktrees && self.reintegration.enabled {
            issues.push(ConfigIssue::warning(
                "reintegration.enabled",
                "has no effect without useWorktrees",
            ));
        }

        issues
    }

    /// First validation error, if any.
    pub fn ensure_valid(&self) -> Result<()> {
        match self
            .validate()
            .into_iter()
            .find(|i| i.severity == ConfigSeverity::Error)
        {
            Some(issue) => Err(HealerError::InvalidConfig {
                field: issue.field,
                reason: issue.message,
            }),
            None => Ok(()),
        }
    }
}
