/// Single attempt lifecycle: spawn the command through a shell, stream its
/// stdout and stderr through the watchdog, kill it on timeout, and report the
/// result (exit code, timeout flag, duration, captured output).
use crate::retry::AttemptRunner;
use crate::signals::{self, ActiveGroup};
use crate::watchdog::{StreamEvent, StreamKind, Watchdog, WatchdogOutcome};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Capacity of the line channel between the pipe readers and the watchdog.
const LINE_BUFFER: usize = 256;

/// Result of a completed attempt.
#[derive(Debug, Clone)]
pub struct SessionResult {
    /// Exit code; `None` when the watchdog killed the process.
    pub exit_code: Option<i32>,
    /// Whether the attempt was killed for producing no output in time.
    pub timed_out: bool,
    /// Wall-clock duration from spawn until the process was reaped.
    pub duration: Duration,
    /// Stdout and stderr lines in arrival order, each terminated by `\n`.
    pub output: String,
    /// Child PID (for logging/diagnostics).
    pub pid: u32,
}

impl SessionResult {
    /// Return the first needle that occurs anywhere in the captured output.
    pub fn find_output<'a>(&self, needles: &'a [String]) -> Option<&'a str> {
        needles
            .iter()
            .map(String::as_str)
            .find(|needle| self.output.contains(needle))
    }
}

/// Errors that can occur while running an attempt.
#[derive(Debug)]
pub enum SessionError {
    /// Failed to spawn the shell.
    Spawn {
        shell: String,
        source: std::io::Error,
    },
    /// A pipe that was requested was not attached to the child.
    Pipe { stream: StreamKind },
    /// Failed to reap the child process.
    Wait { source: std::io::Error },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Spawn { shell, source } => {
                write!(f, "failed to spawn command via {}: {}", shell, source)
            }
            SessionError::Pipe { stream } => {
                write!(f, "child {} was not piped", stream)
            }
            SessionError::Wait { source } => {
                write!(f, "failed to wait for command: {}", source)
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Spawn { source, .. } => Some(source),
            SessionError::Pipe { .. } => None,
            SessionError::Wait { source } => Some(source),
        }
    }
}

/// Read `reader` line by line and forward each line to the watchdog.
///
/// Invalid UTF-8 is replaced rather than rejected. A read error ends the stream
/// the same way end-of-file does.
async fn forward_lines<R>(reader: R, stream: StreamKind, tx: mpsc::Sender<StreamEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf).trim_end().to_string();
                if tx.send(StreamEvent::Line { stream, text }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(%stream, error = %e, "read failed, treating as end of stream");
                break;
            }
        }
    }
    let _ = tx.send(StreamEvent::Closed(stream)).await;
}

/// Kill the child and everything in its process group.
fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = signals::kill_process_group(pid) {
        tracing::warn!(pid, error = %e, "failed to kill process group, killing child only");
        if let Err(e) = child.start_kill() {
            tracing::warn!(pid, error = %e, "failed to kill child");
        }
    }
}

/// Run `command` through `shell -c`, enforcing a sliding per-line timeout.
///
/// The command is spawned in its own process group (via `process_group(0)`)
/// so a timeout kills the whole tree, not just the shell. The group is
/// recorded in `group` while the child is alive so a shutdown can kill it.
pub async fn run_session(
    shell: &str,
    command: &str,
    timeout: Option<Duration>,
    group: &ActiveGroup,
) -> Result<SessionResult, SessionError> {
    let start = Instant::now();

    let mut child = Command::new(shell)
        .arg("-c")
        .arg(command)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0) // New process group for clean kill
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SessionError::Spawn {
            shell: shell.to_string(),
            source: e,
        })?;

    let pid = child.id().unwrap_or(0);
    tracing::debug!(pid, "command started");
    if pid != 0 {
        group.set(pid);
    }

    let stdout = child.stdout.take().ok_or(SessionError::Pipe {
        stream: StreamKind::Stdout,
    })?;
    let stderr = child.stderr.take().ok_or(SessionError::Pipe {
        stream: StreamKind::Stderr,
    })?;

    let (tx, mut rx) = mpsc::channel(LINE_BUFFER);
    let stdout_task = tokio::spawn(forward_lines(stdout, StreamKind::Stdout, tx.clone()));
    let stderr_task = tokio::spawn(forward_lines(stderr, StreamKind::Stderr, tx));

    let mut watchdog = Watchdog::new(timeout);
    let timed_out = watchdog.monitor(&mut rx).await == WatchdogOutcome::TimedOut;
    if timed_out {
        tracing::warn!(
            pid,
            timeout_secs = timeout.map(|t| t.as_secs()).unwrap_or(0),
            "reached timeout, killing process"
        );
        terminate(&mut child);
    }

    // Dropping the readers closes our end of the pipes, so a child still
    // writing to the other stream gets EPIPE instead of blocking forever.
    stdout_task.abort();
    stderr_task.abort();
    drop(rx);

    // Not bounded: after a stream closes without a timeout kill, this waits
    // for the child to exit however long it keeps running silently.
    let status = child.wait().await;
    group.clear();
    let status = status.map_err(|e| SessionError::Wait { source: e })?;
    let duration = start.elapsed();

    let exit_code = if timed_out {
        None
    } else {
        signals::exit_code(status)
    };
    tracing::debug!(
        pid,
        exit_code = ?exit_code,
        timed_out,
        lines = watchdog.lines(),
        duration_ms = duration.as_millis() as u64,
        "command completed"
    );

    Ok(SessionResult {
        exit_code,
        timed_out,
        duration,
        output: watchdog.into_output(),
        pid,
    })
}

/// Runs attempts through a real shell.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    group: ActiveGroup,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>, group: ActiveGroup) -> Self {
        Self {
            shell: shell.into(),
            group,
        }
    }
}

impl AttemptRunner for ShellRunner {
    async fn run(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<SessionResult, SessionError> {
        run_session(&self.shell, command, timeout, &self.group).await
    }
}
