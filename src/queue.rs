//! Serial issue queue.
//!
//! One worker drains a FIFO of issues; only one issue is ever being fixed.
//! Producers submit through a [`QueueHandle`]. When an issue is given up on,
//! a [`HumanDecider`] chooses what happens next. A login decision pauses the
//! queue and schedules a single delayed resume.

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{HealerError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::issue::{Issue, IssueId};
use crate::ledger::{Ledger, LedgerEvent};
use crate::pipeline::FixPipeline;
use crate::state::StateDir;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fs2::FileExt;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What to do with an issue that exhausted its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HumanDecision {
    Retry,
    Skip,
    OpenLog,
    Login,
}

/// Asked after an issue fails for good.
#[async_trait]
pub trait HumanDecider: Send + Sync {
    async fn decide(&self, issue: &Issue, error: &HealerError, log_path: &Path) -> HumanDecision;
}

/// Fixes one issue. `Err` means the issue was given up on.
#[async_trait]
pub trait IssueRunner: Send + Sync {
    async fn run(&self, issue: &Issue) -> Result<()>;
}

#[async_trait]
impl IssueRunner for FixPipeline {
    async fn run(&self, issue: &Issue) -> Result<()> {
        self.run_issue(issue).await.map(|_| ())
    }
}

/// Sending side of the queue.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<Issue>,
}

impl QueueHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Issue>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn submit(&self, issue: Issue) -> Result<()> {
        self.tx
            .send(issue)
            .await
            .map_err(|_| HealerError::Other(anyhow::anyhow!("issue queue has shut down")))
    }
}

/// Exclusive `queue.lock` for the workspace, released on drop.
#[derive(Debug)]
pub struct QueueLock {
    file: File,
}

impl QueueLock {
    pub fn acquire(state: &StateDir) -> Result<Self> {
        state.ensure()?;
        let path = state.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| HealerError::QueueBusy { path })?;
        Ok(Self { file })
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Result of one queue step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueStep {
    Succeeded(IssueId),
    Failed(IssueId, HumanDecision),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSummary {
    pub succeeded: Vec<IssueId>,
    pub failed: Vec<IssueId>,
    pub dropped: usize,
}

impl QueueSummary {
    fn record(&mut self, step: &QueueStep) {
        match step {
            QueueStep::Succeeded(id) => self.succeeded.push(id.clone()),
            QueueStep::Failed(id, HumanDecision::Skip) => self.failed.push(id.clone()),
            QueueStep::Failed(..) => {}
        }
    }
}

pub struct IssueQueue<R: IssueRunner> {
    runner: R,
    decider: Arc<dyn HumanDecider>,
    clock: Arc<dyn Clock>,
    state: StateDir,
    ledger: Ledger,
    events: EventBus,
    config: QueueConfig,
    pending: VecDeque<Issue>,
    accepted_signatures: HashMap<String, DateTime<Utc>>,
    resume_at: Option<Instant>,
    dropped: usize,
    _lock: QueueLock,
}

impl<R: IssueRunner> IssueQueue<R> {
    /// Take the workspace queue lock; fails with `QueueBusy` if another
    /// worker holds it.
    pub fn new(
        runner: R,
        decider: Arc<dyn HumanDecider>,
        clock: Arc<dyn Clock>,
        state: StateDir,
        config: QueueConfig,
        events: EventBus,
    ) -> Result<Self> {
        let lock = QueueLock::acquire(&state)?;
        let ledger = Ledger::new(state.ledger_path());
        Ok(Self {
            runner,
            decider,
            clock,
            state,
            ledger,
            events,
            config,
            pending: VecDeque::new(),
            accepted_signatures: HashMap::new(),
            resume_at: None,
            dropped: 0,
            _lock: lock,
        })
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.resume_at.is_some()
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Accept an issue at the back of the queue. Returns `false` when it
    /// was dropped.
    ///
    /// Reruns bypass the signature cooldown; they repeat a signature on
    /// purpose.
    pub fn enqueue(&mut self, issue: Issue) -> bool {
        let now = self.clock.now();
        if !self.config.enabled && !self.pending.is_empty() {
            debug!("Queue disabled and busy; dropping {}", issue.id);
            self.dropped += 1;
            return false;
        }
        if issue.rerun_of.is_none() && !issue.signature.is_empty() {
            let cooldown = ChronoDuration::milliseconds(
                i64::try_from(self.config.signature_cooldown_ms).unwrap_or(i64::MAX),
            );
            if let Some(last) = self.accepted_signatures.get(&issue.signature) {
                if now.signed_duration_since(*last) < cooldown {
                    debug!(
                        "Dropping {} ({}): signature {} is cooling down",
                        issue.id, issue.title, issue.signature
                    );
                    self.dropped += 1;
                    return false;
                }
            }
            self.accepted_signatures
                .insert(issue.signature.clone(), now);
        }

        self.ledger.record(&LedgerEvent::IssueCreated {
            id: issue.id.clone(),
            at: now,
            source: issue.source.clone(),
            sig: issue.signature.clone(),
            kind: issue.kind,
            title: issue.title.clone(),
            rerun_of: issue.rerun_of.clone(),
        });
        self.events.emit(PipelineEvent::Queued {
            id: issue.id.clone(),
            title: issue.title.clone(),
        });
        info!("Queued {} ({}); {} pending", issue.id, issue.title, self.pending.len() + 1);
        self.pending.push_back(issue);
        true
    }

    /// Pause until `delay` has passed. Replaces any earlier resume time.
    pub fn pause_for(&mut self, delay: Duration) {
        self.resume_at = Some(Instant::now() + delay);
        self.events.emit(PipelineEvent::Paused {
            resume_in_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });
        info!("Queue paused for {:?}", delay);
    }

    async fn wait_if_paused(&mut self) {
        if let Some(at) = self.resume_at.take() {
            tokio::time::sleep_until(at).await;
            self.events.emit(PipelineEvent::Resumed);
            info!("Queue resumed");
        }
    }

    /// Fix the issue at the front of the queue.
    pub async fn run_next(&mut self) -> Option<QueueStep> {
        self.wait_if_paused().await;
        let issue = self.pending.pop_front()?;

        let error = match self.runner.run(&issue).await {
            Ok(()) => return Some(QueueStep::Succeeded(issue.id)),
            Err(e) => e,
        };

        let id = issue.id.as_str();
        let final_path = self.state.final_error_path(id);
        if let Err(e) = self
            .state
            .write_artifact(&final_path, &format!("{error}\n\n{error:?}\n"))
        {
            warn!("Failed to save final error for {}: {}", id, e);
        }

        let log_path = self.state.fix_log_path(id);
        let decision = self.decider.decide(&issue, &error, &log_path).await;
        info!("Issue {} failed; decision: {:?}", id, decision);
        let issue_id = issue.id.clone();
        match decision {
            HumanDecision::Skip => {}
            HumanDecision::Retry | HumanDecision::OpenLog => self.pending.push_front(issue),
            HumanDecision::Login => {
                self.pending.push_front(issue);
                self.pause_for(Duration::from_millis(self.config.auth_resume_delay_ms));
            }
        }
        Some(QueueStep::Failed(issue_id, decision))
    }

    /// Run until nothing is pending.
    pub async fn run_until_idle(&mut self) -> QueueSummary {
        let mut summary = QueueSummary::default();
        while let Some(step) = self.run_next().await {
            summary.record(&step);
        }
        summary.dropped = self.dropped;
        summary
    }

    /// Serve issues from `rx` until the channel closes and the queue drains.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Issue>) -> QueueSummary {
        let mut summary = QueueSummary::default();
        loop {
            while let Ok(issue) = rx.try_recv() {
                self.enqueue(issue);
            }
            if self.pending.is_empty() {
                match rx.recv().await {
                    Some(issue) => {
                        self.enqueue(issue);
                        continue;
                    }
                    None => break,
                }
            }
            if let Some(step) = self.run_next().await {
                summary.record(&step);
            }
        }
        summary.dropped = self.dropped;
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::IssueKind;
    use crate::testing::MockClock;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Fails issues whose title starts with "fail", recording run order.
    #[derive(Default)]
    struct RecordingRunner {
        runs: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl IssueRunner for RecordingRunner {
        async fn run(&self, issue: &Issue) -> Result<()> {
            self.runs.lock().unwrap().push(issue.title.clone());
            if issue.title.starts_with("fail") {
                return Err(HealerError::AuthenticationRequired {
                    detail: "login".into(),
                });
            }
            Ok(())
        }
    }

    struct ScriptedDecider(Mutex<VecDeque<HumanDecision>>);

    impl ScriptedDecider {
        fn new(decisions: Vec<HumanDecision>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(decisions.into())))
        }
    }

    #[async_trait]
    impl HumanDecider for ScriptedDecider {
        async fn decide(&self, _: &Issue, _: &HealerError, _: &Path) -> HumanDecision {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(HumanDecision::Skip)
        }
    }

    fn queue(
        tmp: &TempDir,
        decider: Arc<ScriptedDecider>,
        clock: Arc<MockClock>,
    ) -> IssueQueue<RecordingRunner> {
        let config = QueueConfig {
            auth_resume_delay_ms: 20,
            ..QueueConfig::default()
        };
        IssueQueue::new(
            RecordingRunner::default(),
            decider,
            clock,
            StateDir::new(tmp.path()),
            config,
            EventBus::default(),
        )
        .unwrap()
    }

    fn issue(title: &str, sig: &str) -> Issue {
        Issue::new(title, "test", IssueKind::Runtime)
            .with_signature(sig)
            .with_prompt_text("p")
    }

    fn runs(q: &IssueQueue<RecordingRunner>) -> Vec<String> {
        q.runner().runs.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_fifo_order_and_ledger() {
        let tmp = TempDir::new().unwrap();
        let mut q = queue(&tmp, ScriptedDecider::new(vec![]), Arc::new(MockClock::new()));
        assert!(q.enqueue(issue("a", "s1")));
        assert!(q.enqueue(issue("b", "s2")));
        let summary = q.run_until_idle().await;
        assert_eq!(runs(&q), vec!["a", "b"]);
        assert_eq!(summary.succeeded.len(), 2);
        let ledger = Ledger::new(StateDir::new(tmp.path()).ledger_path());
        assert_eq!(ledger.read_all().len(), 2);
    }

    #[tokio::test]
    async fn test_signature_cooldown_uses_clock() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(MockClock::new());
        let mut q = queue(&tmp, ScriptedDecider::new(vec![]), clock.clone());
        assert!(q.enqueue(issue("a", "same")));
        assert!(!q.enqueue(issue("a again", "same")));
        clock.advance_ms(30_001);
        assert!(q.enqueue(issue("a later", "same")));

        let rerun = issue("rerun", "same").with_rerun_of("dh_x".into());
        assert!(q.enqueue(rerun));
        assert_eq!(q.run_until_idle().await.dropped, 1);
    }

    #[tokio::test]
    async fn test_second_worker_is_refused() {
        let tmp = TempDir::new().unwrap();
        let _q = queue(&tmp, ScriptedDecider::new(vec![]), Arc::new(MockClock::new()));
        let second = IssueQueue::new(
            RecordingRunner::default(),
            ScriptedDecider::new(vec![]),
            Arc::new(MockClock::new()),
            StateDir::new(tmp.path()),
            QueueConfig::default(),
            EventBus::default(),
        );
        assert!(matches!(second, Err(HealerError::QueueBusy { .. })));
    }

    #[tokio::test]
    async fn test_login_requeues_front_and_pauses_once() {
        let tmp = TempDir::new().unwrap();
        let mut q = queue(
            &tmp,
            ScriptedDecider::new(vec![HumanDecision::Login, HumanDecision::Skip]),
            Arc::new(MockClock::new()),
        );
        q.enqueue(issue("fail-auth", "s1"));
        q.enqueue(issue("next", "s2"));

        let step = q.run_next().await.unwrap();
        assert!(matches!(step, QueueStep::Failed(_, HumanDecision::Login)));
        assert!(q.is_paused());
        assert_eq!(q.len(), 2);

        let started = Instant::now();
        q.run_next().await;
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(!q.is_paused());
        assert_eq!(runs(&q), vec!["fail-auth", "fail-auth"]);

        let summary = q.run_until_idle().await;
        assert_eq!(runs(&q).last().map(String::as_str), Some("next"));
        assert_eq!(summary.succeeded.len(), 1);
    }

    #[tokio::test]
    async fn test_final_error_saved_and_skip_drops() {
        let tmp = TempDir::new().unwrap();
        let mut q = queue(&tmp, ScriptedDecider::new(vec![HumanDecision::Skip]), Arc::new(MockClock::new()));
        let failing = issue("fail", "s1");
        let id = failing.id.clone();
        q.enqueue(failing);
        let summary = q.run_until_idle().await;
        assert_eq!(summary.failed, vec![id.clone()]);
        assert!(q.is_empty());
        let text = std::fs::read_to_string(StateDir::new(tmp.path()).final_error_path(id.as_str())).unwrap();
        assert!(text.starts_with("Authentication required: login"));
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp, ScriptedDecider::new(vec![]), Arc::new(MockClock::new()));
        let (handle, rx) = QueueHandle::channel(8);
        handle.submit(issue("one", "s1")).await.unwrap();
        handle.submit(issue("two", "s2")).await.unwrap();
        drop(handle);
        let summary = q.run(rx).await;
        assert_eq!(summary.succeeded.len(), 2);
    }
}
