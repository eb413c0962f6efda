//! Small shared helpers: display truncation for chat messages and
//! subprocess execution with a hard timeout.

use std::io::{BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Truncate a string to `max` characters, appending `...` when cut.
/// Char-based so multi-byte text is never split mid-codepoint.
pub fn truncate(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_none() {
        return head;
    }
    if max <= 3 {
        return head;
    }
    let mut cut: String = s.chars().take(max - 3).collect();
    cut.push_str("...");
    cut
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandRunResult {
    /// Stdout and stderr merged for display, stderr after stdout, both
    /// stripped of trailing newlines.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        let err = self.stderr.trim_end();
        if !err.trim().is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// Run a command, capturing stdout/stderr, killing it if it exceeds `timeout`.
///
/// A timed-out run is reported via `timed_out`, not conflated with a
/// non-zero exit status.
pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<CommandRunResult, String> {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;

    let stdout_reader = drain_pipe(child.stdout.take(), "stdout")?;
    let stderr_reader = drain_pipe(child.stderr.take(), "stderr")?;

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) if Instant::now() >= deadline => {
                timed_out = true;
                let _ = child.kill();
                break child.wait().ok();
            }
            Ok(None) => thread::sleep(WAIT_POLL_INTERVAL),
            Err(e) => return Err(format!("Failed to wait for command: {}", e)),
        }
    };

    Ok(CommandRunResult {
        status,
        stdout: stdout_reader.join().unwrap_or_default(),
        stderr: stderr_reader.join().unwrap_or_default(),
        timed_out,
    })
}

/// Drain a child pipe on its own thread so the child can't block on a
/// full pipe buffer while we poll for exit.
fn drain_pipe<R: Read + Send + 'static>(
    pipe: Option<R>,
    name: &'static str,
) -> Result<thread::JoinHandle<String>, String> {
    let pipe = pipe.ok_or_else(|| format!("Failed to capture {}", name))?;
    Ok(thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = BufReader::new(pipe).read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }))
}
