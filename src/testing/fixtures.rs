//! Throwaway git repositories for tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// A temporary repository with one commit on `main`.
///
/// # Example
///
/// ```rust,ignore
/// let repo = GitFixture::new();
/// repo.write("src/app.ts", "export const x = 1;\n");
/// repo.commit_all("add app");
/// ```
pub struct GitFixture {
    dir: TempDir,
}

impl GitFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let fixture = Self { dir };
        fixture.git(&["init", "-q", "-b", "main"]);
        fixture.git(&["config", "user.email", "healer@example.com"]);
        fixture.git(&["config", "user.name", "Healer Test"]);
        fixture.git(&["config", "commit.gpgsign", "false"]);
        fixture.write("README.md", "# fixture\n");
        fixture.commit_all("initial");
        fixture
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(path, content).expect("write fixture file");
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.join(rel)).expect("read fixture file")
    }

    /// Run git in the repository, panicking on failure.
    pub fn git(&self, args: &[&str]) -> String {
        git_in(self.path(), args)
    }

    pub fn commit_all(&self, message: &str) -> String {
        self.git(&["add", "-A"]);
        self.git(&["commit", "-q", "-m", message]);
        self.head()
    }

    pub fn head(&self) -> String {
        self.git(&["rev-parse", "HEAD"])
    }
}

impl Default for GitFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Run git in `dir`, panicking on failure, returning trimmed stdout.
pub fn git_in(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// True when a `git` executable is on PATH.
pub fn git_available() -> bool {
    which::which("git").is_ok()
}
