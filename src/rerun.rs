//! Rerunning the last issue from its saved prompt.

use crate::clock::Clock;
use crate::error::{HealerError, Result};
use crate::issue::{Issue, IssueId};
use crate::ledger::Ledger;
use crate::state::StateDir;
use tracing::info;

/// Build a fresh issue that replays the newest ledger issue's saved prompt.
///
/// The new issue gets its own id so the earlier run's logs, patches and
/// worktree stay untouched. Its prompt is saved under the new id before it
/// is returned.
pub fn prepare_rerun(state: &StateDir, ledger: &Ledger, clock: &dyn Clock) -> Result<Issue> {
    let last = ledger
        .latest_issue()
        .ok_or_else(|| HealerError::NothingToRerun {
            reason: "no previous issue in the ledger".to_string(),
        })?;

    let prompt_path = state.prompt_path(last.id.as_str());
    let prompt = std::fs::read_to_string(&prompt_path).map_err(|_| HealerError::NothingToRerun {
        reason: format!(
            "no saved prompt for {} at {}",
            last.id,
            prompt_path.display()
        ),
    })?;

    let now = clock.now();
    let mut issue = Issue::new(format!("Rerun ({})", last.id), last.source, last.kind)
        .with_id(IssueId::generate(now))
        .with_signature(last.sig)
        .with_prompt_text(prompt.clone())
        .with_rerun_of(last.id.clone());
    issue.enqueued_at = now;

    state.write_artifact(&state.prompt_path(issue.id.as_str()), &prompt)?;
    info!("Prepared rerun {} of {}", issue.id, last.id);
    Ok(issue)
}
