/// Output-activity monitor for a running command.
///
/// Consumes the merged line stream of a child process and enforces a sliding
/// deadline: every line pushes the deadline forward by `timeout`. If the
/// deadline passes before the next line arrives, the monitor reports a
/// timeout and the caller kills the process.
use std::fmt;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// How long to keep reading the other stream once one stream has closed.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Events produced by the pipe readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A complete line, already decoded and stripped of trailing whitespace.
    Line { stream: StreamKind, text: String },
    /// The stream reached end-of-file (or failed and will produce nothing more).
    Closed(StreamKind),
}

/// How a watchdog run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// One of the streams closed; the command is finishing on its own.
    Finished,
    /// No line arrived within the timeout.
    TimedOut,
}

pub struct Watchdog {
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    echo: bool,
    output: String,
    lines: usize,
}

impl Watchdog {
    /// Create a watchdog whose first deadline is `timeout` from now.
    ///
    /// `None` disables the deadline entirely.
    pub fn new(timeout: Option<Duration>) -> Self {
        let mut watchdog = Self {
            timeout,
            deadline: None,
            echo: true,
            output: String::new(),
            lines: 0,
        };
        watchdog.reset_deadline();
        watchdog
    }

    /// Stop echoing lines to stdout. Lines are still captured.
    #[cfg(test)]
    pub fn silent(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Push the deadline to `timeout` from now.
    ///
    /// A deadline too far away to represent is the same as no deadline.
    fn reset_deadline(&mut self) {
        self.deadline = self
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
    }

    fn record(&mut self, stream: StreamKind, text: String) {
        if self.echo {
            println!("{text}");
            let _ = std::io::stdout().flush();
        }
        self.output.push_str(&text);
        self.output.push('\n');
        self.lines += 1;
        debug!(%stream, lines = self.lines, "line received, deadline reset");
        self.reset_deadline();
    }

    /// Consume events until a stream closes or the deadline passes.
    ///
    /// End-of-file on either stream ends the run. The other stream is read only
    /// while it keeps producing lines at least every [`CLOSE_GRACE`]; it is not
    /// waited on until its own end-of-file.
    pub async fn monitor(&mut self, events: &mut mpsc::Receiver<StreamEvent>) -> WatchdogOutcome {
        loop {
            let deadline = self.deadline;
            let expired = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(StreamEvent::Line { stream, text }) => self.record(stream, text),
                    Some(StreamEvent::Closed(stream)) => {
                        debug!(%stream, "stream closed");
                        self.finish(events, stream).await;
                        return WatchdogOutcome::Finished;
                    }
                    None => return WatchdogOutcome::Finished,
                },
                () = expired => return WatchdogOutcome::TimedOut,
            }
        }
    }

    async fn finish(&mut self, events: &mut mpsc::Receiver<StreamEvent>, closed: StreamKind) {
        loop {
            match tokio::time::timeout(CLOSE_GRACE, events.recv()).await {
                Ok(Some(StreamEvent::Line { stream, text })) => self.record(stream, text),
                Ok(Some(StreamEvent::Closed(stream))) if stream != closed => return,
                Ok(Some(StreamEvent::Closed(_))) => {}
                Ok(None) => return,
                Err(_) => {
                    debug!(grace_ms = CLOSE_GRACE.as_millis() as u64, "no more output after close");
                    return;
                }
            }
        }
    }

    /// Number of lines captured so far.
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Captured output, one `\n`-terminated line per received line.
    pub fn into_output(self) -> String {
        self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(stream: StreamKind, text: &str) -> StreamEvent {
        StreamEvent::Line {
            stream,
            text: text.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_output() {
        let (_tx, mut rx) = mpsc::channel(8);
        let start = Instant::now();
        let mut watchdog = Watchdog::new(Some(Duration::from_secs(5))).silent();

        assert_eq!(watchdog.monitor(&mut rx).await, WatchdogOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(watchdog.lines(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lines_slide_the_deadline() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for text in ["a", "b", "c", "d"] {
                tokio::time::sleep(Duration::from_secs(3)).await;
                tx.send(line(StreamKind::Stdout, text)).await.unwrap();
            }
            tx.send(StreamEvent::Closed(StreamKind::Stdout))
                .await
                .unwrap();
        });

        let start = Instant::now();
        let mut watchdog = Watchdog::new(Some(Duration::from_secs(5))).silent();
        assert_eq!(watchdog.monitor(&mut rx).await, WatchdogOutcome::Finished);
        // 12s total is well past a single 5s window.
        assert!(start.elapsed() >= Duration::from_secs(12));
        assert_eq!(watchdog.into_output(), "a\nb\nc\nd\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_counts_from_last_line() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            tx.send(line(StreamKind::Stderr, "progress")).await.unwrap();
            // Keep the sender alive past the deadline.
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(tx);
        });

        let start = Instant::now();
        let mut watchdog = Watchdog::new(Some(Duration::from_secs(5))).silent();
        assert_eq!(watchdog.monitor(&mut rx).await, WatchdogOutcome::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(9));
        assert!(elapsed < Duration::from_secs(10));
        assert_eq!(watchdog.into_output(), "progress\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_timeout_waits_indefinitely() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60 * 60 * 24)).await;
            tx.send(line(StreamKind::Stdout, "finally")).await.unwrap();
            tx.send(StreamEvent::Closed(StreamKind::Stdout))
                .await
                .unwrap();
        });

        let mut watchdog = Watchdog::new(None).silent();
        assert_eq!(watchdog.monitor(&mut rx).await, WatchdogOutcome::Finished);
        assert_eq!(watchdog.into_output(), "finally\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_is_unbounded() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(line(StreamKind::Stdout, "x")).await.unwrap();
        tx.send(StreamEvent::Closed(StreamKind::Stdout))
            .await
            .unwrap();

        let mut watchdog = Watchdog::new(Some(Duration::MAX)).silent();
        assert_eq!(watchdog.monitor(&mut rx).await, WatchdogOutcome::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interleaves_streams_in_arrival_order() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(line(StreamKind::Stdout, "one")).await.unwrap();
        tx.send(line(StreamKind::Stderr, "two")).await.unwrap();
        tx.send(line(StreamKind::Stdout, "three")).await.unwrap();
        tx.send(StreamEvent::Closed(StreamKind::Stdout))
            .await
            .unwrap();

        let mut watchdog = Watchdog::new(Some(Duration::from_secs(1))).silent();
        assert_eq!(watchdog.monitor(&mut rx).await, WatchdogOutcome::Finished);
        assert_eq!(watchdog.into_output(), "one\ntwo\nthree\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_either_stream_closing_ends_the_run() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(StreamEvent::Closed(StreamKind::Stderr))
            .await
            .unwrap();
        tx.send(line(StreamKind::Stdout, "queued")).await.unwrap();
        let other = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = other.send(line(StreamKind::Stdout, "soon")).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            let _ = other.send(line(StreamKind::Stdout, "late")).await;
        });

        let start = Instant::now();
        let mut watchdog = Watchdog::new(Some(Duration::from_secs(30))).silent();
        assert_eq!(watchdog.monitor(&mut rx).await, WatchdogOutcome::Finished);
        // stdout never closed; reading stops one grace period after its last line.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500) + CLOSE_GRACE);
        assert!(elapsed < Duration::from_secs(5));
        assert_eq!(watchdog.into_output(), "queued\nsoon\n");
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_streams_closed_finishes_immediately() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(line(StreamKind::Stdout, "out")).await.unwrap();
        tx.send(StreamEvent::Closed(StreamKind::Stdout))
            .await
            .unwrap();
        tx.send(line(StreamKind::Stderr, "err")).await.unwrap();
        tx.send(StreamEvent::Closed(StreamKind::Stderr))
            .await
            .unwrap();

        let start = Instant::now();
        let mut watchdog = Watchdog::new(Some(Duration::from_secs(30))).silent();
        assert_eq!(watchdog.monitor(&mut rx).await, WatchdogOutcome::Finished);
        assert!(start.elapsed() < CLOSE_GRACE);
        assert_eq!(watchdog.into_output(), "out\nerr\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_senders_dropped_finishes() {
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(8);
        drop(tx);
        let mut watchdog = Watchdog::new(Some(Duration::from_secs(5))).silent();
        assert_eq!(watchdog.monitor(&mut rx).await, WatchdogOutcome::Finished);
    }

    #[test]
    fn test_stream_kind_display() {
        assert_eq!(StreamKind::Stdout.to_string(), "stdout");
        assert_eq!(StreamKind::Stderr.to_string(), "stderr");
    }
}
