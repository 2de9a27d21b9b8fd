//! Subprocess execution with captured and streamed output.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{interval_at, Instant, Interval};

/// Exit code and decoded output of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// `stderr` and `stdout` tails formatted for an error message.
    pub fn describe_tails(&self, max_chars: usize) -> String {
        let mut out = String::new();
        let stderr = tail_chars(self.stderr.trim(), max_chars);
        let stdout = tail_chars(self.stdout.trim(), max_chars);
        if !stderr.is_empty() {
            out.push_str("\n\nstderr:\n");
            out.push_str(stderr);
        }
        if !stdout.is_empty() {
            out.push_str("\n\nstdout:\n");
            out.push_str(stdout);
        }
        out
    }
}

/// The last `max_chars` characters of `s`.
pub fn tail_chars(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = count - max_chars;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => "",
    }
}

/// The first `max_chars` characters of `s`.
pub fn head_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Something observed while a streamed process runs.
#[derive(Debug)]
pub enum ProcessEvent<'a> {
    Stdout(&'a str),
    Stderr(&'a str),
    /// Periodic wake-up, independent of output.
    Tick,
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Run `cmd` to completion, writing `input` to stdin and reporting output
/// chunks as they arrive. The full output is also returned.
pub async fn run_streaming<F>(
    mut cmd: Command,
    input: Option<&str>,
    tick: Option<Duration>,
    mut on_event: F,
) -> io::Result<CommandOutput>
where
    F: FnMut(ProcessEvent<'_>),
{
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    if let (Some(mut stdin), Some(data)) = (child.stdin.take(), input) {
        let data = data.to_owned();
        tokio::spawn(async move {
            // A child that exits without reading stdin closes the pipe early.
            let _ = stdin.write_all(data.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });
    }

    let mut out = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("stdout was not captured"))?;
    let mut err = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("stderr was not captured"))?;

    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let (mut out_open, mut err_open) = (true, true);
    let (mut out_text, mut err_text) = (Utf8Chunks::default(), Utf8Chunks::default());
    let mut ticker = tick.map(|period| interval_at(Instant::now() + period, period));

    while out_open || err_open {
        tokio::select! {
            read = out.read(&mut out_buf), if out_open => {
                let n = read?;
                if n == 0 {
                    out_open = false;
                    if let Some(rest) = out_text.flush() {
                        on_event(ProcessEvent::Stdout(&rest));
                    }
                } else {
                    stdout.extend_from_slice(&out_buf[..n]);
                    let text = out_text.push(&out_buf[..n]);
                    if !text.is_empty() {
                        on_event(ProcessEvent::Stdout(&text));
                    }
                }
            }
            read = err.read(&mut err_buf), if err_open => {
                let n = read?;
                if n == 0 {
                    err_open = false;
                    if let Some(rest) = err_text.flush() {
                        on_event(ProcessEvent::Stderr(&rest));
                    }
                } else {
                    stderr.extend_from_slice(&err_buf[..n]);
                    let text = err_text.push(&err_buf[..n]);
                    if !text.is_empty() {
                        on_event(ProcessEvent::Stderr(&text));
                    }
                }
            }
            _ = next_tick(&mut ticker) => on_event(ProcessEvent::Tick),
        }
    }

    let status = child.wait().await?;
    Ok(CommandOutput {
        code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Decodes a byte stream read in arbitrary chunks. A character split across
/// two reads is held back until its remaining bytes arrive.
#[derive(Debug, Default)]
struct Utf8Chunks {
    pending: Vec<u8>,
}

impl Utf8Chunks {
    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end.
                            self.pending.drain(..valid);
                            return text;
                        }
                    }
                }
            }
        }
    }

    /// Whatever is left at end of stream, decoded lossily.
    fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Run `cmd` to completion and capture its output.
pub async fn run_captured(cmd: Command, input: Option<&str>) -> io::Result<CommandOutput> {
    run_streaming(cmd, input, None, |_| {}).await
}

/// A command line run through the platform shell.
pub fn shell_command(command_line: &str, cwd: &Path) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command_line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command_line);
        c
    };
    cmd.current_dir(cwd);
    cmd
}
