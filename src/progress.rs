//! Terminal rendering of pipeline events.

use colored::Colorize;
use healer::events::{EventBus, PipelineEvent};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Spinner that follows [`PipelineEvent`]s until aborted.
pub struct ProgressReporter {
    task: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn(events: &EventBus) -> Self {
        let mut rx = events.subscribe();
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg}") {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(100));

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => render(&bar, event),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
            bar.finish_and_clear();
        });
        Self { task }
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

fn render(bar: &ProgressBar, event: PipelineEvent) {
    match event {
        PipelineEvent::Queued { id, title } => {
            bar.println(format!("{} {} {}", "queued".cyan(), id, title.dimmed()));
        }
        PipelineEvent::AttemptStarted {
            id,
            attempt,
            max_attempts,
        } => bar.set_message(format!("{id}: attempt {attempt}/{max_attempts}")),
        PipelineEvent::Stage { id, stage } => bar.set_message(format!("{id}: {stage}")),
        PipelineEvent::Heartbeat {
            id,
            elapsed_secs,
            quiet_secs,
        } => bar.set_message(format!(
            "{id}: still generating ({elapsed_secs}s elapsed, quiet {quiet_secs}s)"
        )),
        PipelineEvent::AttemptFailed {
            id,
            attempt,
            kind,
            message,
        } => bar.println(format!(
            "{} {} attempt {} ({}): {}",
            "failed".yellow(),
            id,
            attempt,
            kind,
            message
        )),
        PipelineEvent::Succeeded { id, sha } => bar.println(format!(
            "{} {} {}",
            "fixed".green().bold(),
            id,
            sha.unwrap_or_default().dimmed()
        )),
        PipelineEvent::Failed { id, message } => {
            bar.println(format!("{} {} {}", "gave up".red().bold(), id, message));
        }
        PipelineEvent::Paused { resume_in_ms } => bar.set_message(format!(
            "paused; resuming in {}s",
            resume_in_ms / 1000
        )),
        PipelineEvent::Resumed => bar.set_message("resumed"),
    }
}
