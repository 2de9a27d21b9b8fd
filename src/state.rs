//! Layout of the `.healer/` state directory.
//!
//! ```text
//! .healer/
//! ├── settings.json
//! ├── issues.jsonl
//! ├── queue.lock
//! ├── worktrees/<slug>/
//! ├── fix-logs/<id>.log
//! ├── patches/<id>[.attempt-N][.raw].diff
//! ├── prompts/<id>.txt
//! └── errors/<id>.attempt-N.txt | <id>.final.txt
//! ```

use crate::error::Result;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Name of the state directory under the workspace root.
pub const STATE_DIR_NAME: &str = ".healer";

const MAX_SLUG_LEN: usize = 80;

/// Paths of everything the pipeline persists for a workspace.
#[derive(Debug, Clone)]
pub struct StateDir {
    workspace_root: PathBuf,
    dir: PathBuf,
}

impl StateDir {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        let dir = workspace_root.join(STATE_DIR_NAME);
        Self {
            workspace_root,
            dir,
        }
    }

    /// Create the directory tree.
    ///
    /// A `.gitignore` of `*` keeps the state out of `git status` in the
    /// workspace, which reintegration relies on to judge cleanliness.
    pub fn ensure(&self) -> Result<()> {
        for sub in ["worktrees", "fix-logs", "patches", "prompts", "errors"] {
            fs::create_dir_all(self.dir.join(sub))?;
        }
        let ignore = self.dir.join(".gitignore");
        if !ignore.exists() {
            fs::write(ignore, "*\n")?;
        }
        Ok(())
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir.join("settings.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.dir.join("issues.jsonl")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join("queue.lock")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.dir.join("worktrees")
    }

    pub fn fix_logs_dir(&self) -> PathBuf {
        self.dir.join("fix-logs")
    }

    pub fn worktree_path(&self, issue_id: &str) -> PathBuf {
        self.worktrees_dir().join(slug(issue_id))
    }

    pub fn fix_log_path(&self, issue_id: &str) -> PathBuf {
        self.fix_logs_dir().join(format!("{issue_id}.log"))
    }

    pub fn prompt_path(&self, issue_id: &str) -> PathBuf {
        self.dir.join("prompts").join(format!("{issue_id}.txt"))
    }

    /// `patches/<id>[.attempt-N][.raw].diff`
    pub fn patch_path(&self, issue_id: &str, attempt: Option<u32>, raw: bool) -> PathBuf {
        let mut name = issue_id.to_string();
        if let Some(n) = attempt {
            name.push_str(&format!(".attempt-{n}"));
        }
        if raw {
            name.push_str(".raw");
        }
        name.push_str(".diff");
        self.dir.join("patches").join(name)
    }

    pub fn attempt_error_path(&self, issue_id: &str, attempt: u32) -> PathBuf {
        self.dir
            .join("errors")
            .join(format!("{issue_id}.attempt-{attempt}.txt"))
    }

    pub fn final_error_path(&self, issue_id: &str) -> PathBuf {
        self.dir.join("errors").join(format!("{issue_id}.final.txt"))
    }

    /// Write an artifact, creating its parent directory.
    pub fn write_artifact(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }
}

/// Directory-safe form of an issue id: lowercase, runs of characters outside
/// `[a-z0-9._-]` collapsed to `-`, at most 80 characters.
pub fn slug(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    let mut in_run = false;
    for c in id.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    out.chars().take(MAX_SLUG_LEN).collect()
}

/// Resolve `.` and `..` components without touching the file system.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True only when `path` lies strictly beneath `root`.
pub fn is_strictly_under(root: &Path, path: &Path) -> bool {
    let root = normalize_path(root);
    let path = normalize_path(path);
    path != root && path.starts_with(&root)
}
