//! Test doubles for the pipeline's seams.
//!
//! These mocks are thread-safe and record how they were called, so tests can
//! assert both on results and on the git/agent traffic a stage produced.

use crate::agent::{AgentMode, AgentRequest, PatchAgent};
use crate::clock::Clock;
use crate::error::{HealerError, Result};
use crate::git::GitRunner;
use crate::process::CommandOutput;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One recorded git invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCall {
    pub cwd: PathBuf,
    pub args: Vec<String>,
    pub input: Option<String>,
}

#[derive(Debug)]
struct ScriptedResponse {
    prefix: Vec<String>,
    outputs: VecDeque<CommandOutput>,
}

/// Mock implementation of [`GitRunner`].
///
/// Responses are keyed by an argument prefix; the longest matching prefix
/// wins. A scripted sequence is consumed in order and its last entry repeats.
/// Unscripted commands succeed with empty output.
///
/// # Example
///
/// ```rust,ignore
/// let git = MockGit::new()
///     .with_response(&["status", "--porcelain"], CommandOutput::ok(""))
///     .with_response(&["rev-parse", "HEAD"], CommandOutput::ok("abc123\n"));
/// ```
#[derive(Debug, Default)]
pub struct MockGit {
    responses: Mutex<Vec<ScriptedResponse>>,
    calls: Mutex<Vec<GitCall>>,
}

impl MockGit {
    /// Create a mock where every command succeeds silently.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a single response for commands starting with `prefix`.
    #[must_use]
    pub fn with_response(self, prefix: &[&str], output: CommandOutput) -> Self {
        self.with_responses(prefix, vec![output])
    }

    /// Script a sequence of responses for commands starting with `prefix`.
    #[must_use]
    pub fn with_responses(self, prefix: &[&str], outputs: Vec<CommandOutput>) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push(ScriptedResponse {
                prefix: prefix.iter().map(|s| s.to_string()).collect(),
                outputs: outputs.into(),
            });
        }
        self
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<GitCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Arguments of every call, joined with spaces.
    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.args.join(" ")).collect()
    }

    /// True if any call started with `prefix`.
    pub fn was_called(&self, prefix: &[&str]) -> bool {
        self.calls().iter().any(|c| starts_with(&c.args, prefix))
    }
}

fn starts_with(args: &[String], prefix: &[impl AsRef<str>]) -> bool {
    args.len() >= prefix.len() && prefix.iter().zip(args).all(|(p, a)| p.as_ref() == a)
}

#[async_trait]
impl GitRunner for MockGit {
    async fn run(&self, cwd: &Path, args: &[&str], input: Option<&str>) -> Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(GitCall {
                cwd: cwd.to_path_buf(),
                args: args.clone(),
                input: input.map(str::to_string),
            });
        }

        let mut responses = self
            .responses
            .lock()
            .map_err(|_| HealerError::git("mock", "response table poisoned"))?;
        let best = responses
            .iter_mut()
            .filter(|r| starts_with(&args, &r.prefix))
            .max_by_key(|r| r.prefix.len());
        let output = match best {
            Some(r) if r.outputs.len() > 1 => r.outputs.pop_front().unwrap_or_default(),
            Some(r) => r.outputs.front().cloned().unwrap_or_default(),
            None => CommandOutput::default(),
        };
        Ok(output)
    }
}

/// One recorded agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCall {
    pub prompt: String,
    pub attempt: u32,
    pub mode: AgentMode,
}

/// Mock implementation of [`PatchAgent`].
///
/// Outputs are returned in order; the last one repeats.
#[derive(Debug, Default)]
pub struct MockPatchAgent {
    outputs: Mutex<VecDeque<CommandOutput>>,
    calls: Mutex<Vec<AgentCall>>,
}

impl MockPatchAgent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful run printing `diff`.
    #[must_use]
    pub fn with_diff(self, diff: &str) -> Self {
        self.with_output(CommandOutput::ok(diff))
    }

    /// Queue an arbitrary output.
    #[must_use]
    pub fn with_output(self, output: CommandOutput) -> Self {
        if let Ok(mut outputs) = self.outputs.lock() {
            outputs.push_back(output);
        }
        self
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Prompts received, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.prompt).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }
}

#[async_trait]
impl PatchAgent for MockPatchAgent {
    async fn generate(&self, request: AgentRequest<'_>) -> Result<CommandOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(AgentCall {
                prompt: request.prompt.to_string(),
                attempt: request.attempt,
                mode: request.mode.clone(),
            });
        }
        let mut outputs = self
            .outputs
            .lock()
            .map_err(|_| HealerError::agent("mock output queue poisoned"))?;
        let output = if outputs.len() > 1 {
            outputs.pop_front().unwrap_or_default()
        } else {
            outputs.front().cloned().unwrap_or_default()
        };
        Ok(output)
    }
}

/// Manually advanced [`Clock`].
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default()),
        }
    }
}

impl MockClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        self.advance(Duration::milliseconds(ms));
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_default()
    }
}
