//! Per-issue attempt state machine.
//!
//! ```text
//! Idle ──> Attempting ──ok──> Success
//!              │
//!              ├──retryable──> RetryableFailure ──(attempts left)──> Attempting
//!              │                      │
//!              │                      └──(budget spent)──> Aborted
//!              └──fatal──> FatalFailure ──> Aborted
//! ```
//!
//! The controller owns the retry policy: it classifies each failure, picks
//! the next attempt's agent overrides and prompt guidance, and stops on
//! fatal errors. The stages themselves run in an [`AttemptExecutor`].

use crate::agent::AgentOverrides;
use crate::classify::{Classification, FailureClassifier, NextAttemptStrategy};
use crate::error::{ErrorKind, HealerError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::fix_log::FixLog;
use crate::issue::IssueId;
use crate::prompt::{
    failure_addendum, join_prompt_parts, malformed_addendum, strict_minimal_addendum,
    FAILURE_LOG_TAIL_LINES,
};
use async_trait::async_trait;
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Attempting,
    RetryableFailure,
    FatalFailure,
    Success,
    Aborted,
}

impl ControllerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Aborted)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Attempting => "attempting",
            Self::RetryableFailure => "retryable failure",
            Self::FatalFailure => "fatal failure",
            Self::Success => "success",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// What one attempt should do differently from the default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptPlan {
    pub number: u32,
    pub max_attempts: u32,
    /// Retry instructions appended to the base prompt. Empty on attempt 1.
    pub guidance: String,
    pub agent_overrides: AgentOverrides,
}

/// One finished attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub number: u32,
    pub succeeded: bool,
    pub error: Option<String>,
    pub kind: Option<ErrorKind>,
}

/// Runs the stages of a single attempt.
#[async_trait]
pub trait AttemptExecutor: Send + Sync {
    type Output: Send;

    async fn execute(&self, plan: &AttemptPlan) -> Result<Self::Output>;

    /// Called once per failed attempt, before the next plan is made.
    async fn on_failure(
        &self,
        _plan: &AttemptPlan,
        _error: &HealerError,
        _classification: &Classification,
    ) {
    }

    /// Last `lines` lines of the attempt's log.
    fn log_tail(&self, _lines: usize) -> String {
        String::new()
    }
}

/// How the controller finished.
#[derive(Debug)]
pub enum ControllerOutcome<T> {
    Succeeded {
        attempt: u32,
        output: T,
    },
    Aborted {
        attempts: u32,
        error: HealerError,
        classification: Classification,
    },
}

impl<T> ControllerOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

pub struct AttemptController<'a, E: AttemptExecutor> {
    executor: E,
    classifier: FailureClassifier,
    max_attempts: u32,
    log: &'a FixLog,
    events: Option<(EventBus, IssueId)>,
    state: ControllerState,
    history: Vec<AttemptRecord>,
}

impl<'a, E: AttemptExecutor> AttemptController<'a, E> {
    pub fn new(executor: E, max_attempts: u32, log: &'a FixLog) -> Self {
        Self {
            executor,
            classifier: FailureClassifier::new(),
            max_attempts: max_attempts.max(1),
            log,
            events: None,
            state: ControllerState::Idle,
            history: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: EventBus, issue_id: IssueId) -> Self {
        self.events = Some((events, issue_id));
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn history(&self) -> &[AttemptRecord] {
        &self.history
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    fn emit(&self, make: impl FnOnce(IssueId) -> PipelineEvent) {
        if let Some((bus, id)) = &self.events {
            bus.emit(make(id.clone()));
        }
    }

    fn transition(&mut self, next: ControllerState) {
        debug!("Attempt controller: {} -> {}", self.state, next);
        self.state = next;
    }

    /// Drive attempts until one succeeds, a fatal error occurs, or the
    /// budget is spent.
    pub async fn run(&mut self) -> ControllerOutcome<E::Output> {
        let max = self.max_attempts;
        let mut plan = AttemptPlan {
            number: 1,
            max_attempts: max,
            ..AttemptPlan::default()
        };

        loop {
            let attempt = plan.number;
            self.transition(ControllerState::Attempting);
            self.log.line(format!("[attempt {attempt}/{max}] starting"));
            self.emit(|id| PipelineEvent::AttemptStarted {
                id,
                attempt,
                max_attempts: max,
            });

            let error = match self.executor.execute(&plan).await {
                Ok(output) => {
                    self.log.line(format!("[attempt {attempt}/{max}] success"));
                    self.history.push(AttemptRecord {
                        number: attempt,
                        succeeded: true,
                        error: None,
                        kind: None,
                    });
                    self.transition(ControllerState::Success);
                    info!("Attempt {}/{} succeeded", attempt, max);
                    return ControllerOutcome::Succeeded { attempt, output };
                }
                Err(e) => e,
            };

            let classification = self.classifier.classify_error(&error);
            let error = promote_auth(error, &classification);
            let message = error.to_string();
            self.log
                .line(format!("[attempt {attempt}/{max}] failed: {message}"));
            warn!(
                "Attempt {}/{} failed ({}): {}",
                attempt,
                max,
                classification.kind,
                first_line(&message)
            );
            self.history.push(AttemptRecord {
                number: attempt,
                succeeded: false,
                error: Some(message.clone()),
                kind: Some(classification.kind),
            });
            self.emit(|id| PipelineEvent::AttemptFailed {
                id,
                attempt,
                kind: classification.kind,
                message: first_line(&message).to_string(),
            });
            self.executor
                .on_failure(&plan, &error, &classification)
                .await;

            if classification.is_fatal() {
                self.transition(ControllerState::FatalFailure);
                self.log.line(format!(
                    "[attempt {attempt}/{max}] {} is not retryable; stopping",
                    classification.kind
                ));
                self.transition(ControllerState::Aborted);
                return ControllerOutcome::Aborted {
                    attempts: attempt,
                    error,
                    classification,
                };
            }

            self.transition(ControllerState::RetryableFailure);
            if attempt >= max {
                self.transition(ControllerState::Aborted);
                return ControllerOutcome::Aborted {
                    attempts: attempt,
                    error,
                    classification,
                };
            }

            plan = self.next_plan(plan, &message, &classification);
        }
    }

    fn next_plan(
        &self,
        previous: AttemptPlan,
        message: &str,
        classification: &Classification,
    ) -> AttemptPlan {
        let attempt = previous.number;
        let max = self.max_attempts;
        let mut guidance = previous.guidance;
        let mut overrides = previous.agent_overrides;

        match classification.strategy {
            NextAttemptStrategy::ForceNonStreaming => {
                overrides = AgentOverrides::quiet();
                guidance = malformed_addendum().to_string();
                self.log.line(format!(
                    "[attempt {attempt}/{max}] forcing non-streaming agent output for next attempt"
                ));
            }
            NextAttemptStrategy::StrictMinimalEdit => {
                overrides = AgentOverrides::quiet();
                guidance = strict_minimal_addendum().to_string();
                self.log.line(format!(
                    "[attempt {attempt}/{max}] forcing strict minimal-diff mode due to non-applying patch"
                ));
            }
            NextAttemptStrategy::AppendFailureDetail | NextAttemptStrategy::Abort => {}
        }

        let tail = (classification.kind == ErrorKind::PostFixCheckFailed)
            .then(|| self.executor.log_tail(FAILURE_LOG_TAIL_LINES));
        let detail = failure_addendum(message, tail.as_deref());
        guidance = join_prompt_parts(&[&guidance, &detail]);
        self.log.line(format!(
            "[attempt {attempt}/{max}] retrying with failure details appended"
        ));

        AttemptPlan {
            number: attempt + 1,
            max_attempts: max,
            guidance,
            agent_overrides: overrides,
        }
    }
}

/// Auth failures recognised from text become the typed variant so callers
/// can offer a login.
fn promote_auth(error: HealerError, classification: &Classification) -> HealerError {
    if classification.kind != ErrorKind::AuthenticationRequired
        || matches!(error, HealerError::AuthenticationRequired { .. })
    {
        return error;
    }
    HealerError::AuthenticationRequired {
        detail: error.to_string(),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
