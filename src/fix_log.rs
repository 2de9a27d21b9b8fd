//! Per-issue fix log.
//!
//! The fix log is the human-readable record of one issue: every attempt,
//! every git and agent invocation, and a closing `[result]` marker that the
//! worktree retention policy reads back later. Writes are best effort; a
//! failing log never fails a fix.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Append-only log file for one issue.
#[derive(Debug, Clone)]
pub struct FixLog {
    path: PathBuf,
}

impl FixLog {
    /// Start a fresh log, truncating any previous content.
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, "")?;
        Ok(Self { path })
    }

    /// Append to an existing log (created on first write).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append text verbatim, normalising carriage returns.
    pub fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let text = text.replace("\r\n", "\n").replace('\r', "\n");
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(text.as_bytes()));
        if let Err(e) = result {
            warn!("Failed to write fix log {}: {}", self.path.display(), e);
        }
    }

    /// Append one line.
    pub fn line(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        debug!(target: "healer::fix_log", "{}", line);
        if line.ends_with('\n') {
            self.append(line);
        } else {
            self.append(&format!("{line}\n"));
        }
    }

    /// Last `n` lines of the log.
    pub fn tail_lines(&self, n: usize) -> String {
        read_tail_lines(&self.path, n)
    }
}

/// Last `n` lines of the file at `path`, or empty when unreadable.
pub fn read_tail_lines(path: &Path, n: usize) -> String {
    let Ok(text) = fs::read_to_string(path) else {
        return String::new();
    };
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Last `max_bytes` bytes of the file at `path`, decoded lossily.
pub fn read_tail_text(path: &Path, max_bytes: usize) -> String {
    let Ok(bytes) = fs::read(path) else {
        return String::new();
    };
    let start = bytes.len().saturating_sub(max_bytes);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

/// Outcome recorded in a fix log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixOutcome {
    Success,
    Failed,
    Unknown,
}

/// Read the outcome marker from log text.
///
/// The last `[result]` line wins. Logs written before that marker existed
/// fall back to the per-attempt success line.
pub fn parse_outcome(text: &str) -> FixOutcome {
    for line in text.lines().rev() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("[result]") {
            return match rest.trim() {
                "success" => FixOutcome::Success,
                "failed" => FixOutcome::Failed,
                _ => FixOutcome::Unknown,
            };
        }
    }
    let legacy_success = text
        .lines()
        .any(|l| l.starts_with("[attempt ") && l.trim_end().ends_with("success"));
    if legacy_success && !text.contains("Fix failed") {
        FixOutcome::Success
    } else if text.contains("Fix failed") {
        FixOutcome::Failed
    } else {
        FixOutcome::Unknown
    }
}

/// Splits a byte stream into complete lines for the log.
pub struct LineWriter<'a> {
    log: &'a FixLog,
    prefix: String,
    pending: String,
}

impl<'a> LineWriter<'a> {
    pub fn new(log: &'a FixLog, prefix: impl Into<String>) -> Self {
        Self {
            log,
            prefix: prefix.into(),
            pending: String::new(),
        }
    }

    pub fn write(&mut self, chunk: &str) {
        self.pending
            .push_str(&chunk.replace("\r\n", "\n").replace('\r', "\n"));
        while let Some(idx) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=idx).collect();
            self.log
                .line(format!("{}{}", self.prefix, line.trim_end_matches('\n')));
        }
    }

    /// Emit any trailing partial line.
    pub fn flush(&mut self) {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.log.line(format!("{}{}", self.prefix, rest));
        }
    }
}

impl Drop for LineWriter<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Buffers raw output and flushes it on an interval or size cap.
pub struct ChunkWriter {
    log: FixLog,
    buffer: String,
    buffered_since: Option<Instant>,
    flush_interval: Duration,
    max_buffer: usize,
}

impl ChunkWriter {
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(250);
    pub const DEFAULT_MAX_BUFFER: usize = 16 * 1024;

    pub fn new(log: FixLog) -> Self {
        Self::with_limits(log, Self::DEFAULT_FLUSH_INTERVAL, Self::DEFAULT_MAX_BUFFER)
    }

    pub fn with_limits(log: FixLog, flush_interval: Duration, max_buffer: usize) -> Self {
        Self {
            log,
            buffer: String::new(),
            buffered_since: None,
            flush_interval,
            max_buffer,
        }
    }

    pub fn write(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        if self.buffer.is_empty() {
            self.buffered_since = Some(Instant::now());
        }
        self.buffer.push_str(chunk);
        if self.buffer.len() >= self.max_buffer {
            self.flush();
        }
    }

    /// Flush if the oldest buffered byte has waited a full interval.
    pub fn poll(&mut self, now: Instant) {
        if let Some(since) = self.buffered_since {
            if now.duration_since(since) >= self.flush_interval {
                self.flush();
            }
        }
    }

    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.buffer);
        self.buffered_since = None;
        self.log.append(&text);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        self.flush();
    }
}
