use crate::session::{SessionError, SessionResult};
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Exit code reported when every attempt timed out or asked for a retry.
pub const EXIT_EXHAUSTED: i32 = 1;

/// Retry policy for a single invocation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sliding per-line timeout; `None` never expires.
    pub timeout: Option<Duration>,
    /// Total number of attempts, at least 1.
    pub max_attempts: u32,
    /// Double the timeout after every attempt.
    pub progressive: bool,
    /// Run the final attempt without any timeout.
    pub skip_timeout_on_last_attempt: bool,
    /// Output substrings that turn a non-zero exit into a retry.
    pub retry_outputs: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(60)),
            max_attempts: 3,
            progressive: false,
            skip_timeout_on_last_attempt: false,
            retry_outputs: Vec::new(),
        }
    }
}

/// Render a timeout for log output.
pub fn describe_timeout(timeout: Option<Duration>) -> String {
    match timeout {
        Some(t) => format!("{}s", t.as_secs_f64()),
        None => "none".to_string(),
    }
}

/// Mutable state of one invocation: which attempt is next and its base timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    attempt: u32,
    current_timeout: Option<Duration>,
}

impl RunState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            current_timeout: policy.timeout,
        }
    }

    /// Zero-based index of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_last(&self, policy: &RetryPolicy) -> bool {
        self.attempt + 1 >= policy.max_attempts
    }

    pub fn has_remaining(&self, policy: &RetryPolicy) -> bool {
        self.attempt < policy.max_attempts
    }

    /// Timeout to hand to the current attempt.
    pub fn effective_timeout(&self, policy: &RetryPolicy) -> Option<Duration> {
        if policy.skip_timeout_on_last_attempt && self.is_last(policy) {
            None
        } else {
            self.current_timeout
        }
    }

    /// Move to the next attempt, doubling the timeout if progressive.
    ///
    /// Doubling saturates at `Duration::MAX`.
    pub fn advance(&mut self, policy: &RetryPolicy) {
        self.attempt += 1;
        if policy.progressive {
            self.current_timeout = self
                .current_timeout
                .map(|t| t.checked_mul(2).unwrap_or(Duration::MAX));
        }
    }
}

/// Why an attempt will be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    TimedOut,
    /// Non-zero exit, but the output contained this configured string.
    OutputMatched(String),
}

/// Decision for a single attempt outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptDecision {
    Succeed,
    Fail { exit_code: i32 },
    Retry(RetryReason),
}

/// Classify an attempt outcome.
///
/// A timeout is always retryable. A non-zero exit is retryable only when one
/// of `policy.retry_outputs` occurs in the captured output.
pub fn evaluate(policy: &RetryPolicy, result: &SessionResult) -> AttemptDecision {
    if result.timed_out {
        return AttemptDecision::Retry(RetryReason::TimedOut);
    }

    let exit_code = result.exit_code.unwrap_or(EXIT_EXHAUSTED);
    if exit_code == 0 {
        return AttemptDecision::Succeed;
    }

    match result.find_output(&policy.retry_outputs) {
        Some(needle) => AttemptDecision::Retry(RetryReason::OutputMatched(needle.to_string())),
        None => AttemptDecision::Fail { exit_code },
    }
}

/// Final state of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Succeeded,
    /// The command failed in a way that retrying will not fix.
    Failed { exit_code: i32 },
    /// Every attempt was used up without success.
    Exhausted { attempts: u32 },
}

impl Verdict {
    /// Exit code the whole program should terminate with.
    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Succeeded => 0,
            Verdict::Failed { exit_code } => *exit_code,
            Verdict::Exhausted { .. } => EXIT_EXHAUSTED,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Succeeded => write!(f, "succeeded"),
            Verdict::Failed { exit_code } => write!(f, "failed with exit code {exit_code}"),
            Verdict::Exhausted { attempts } => write!(f, "gave up after {attempts} attempts"),
        }
    }
}

/// Runs one attempt of a command with the given timeout.
pub trait AttemptRunner {
    async fn run(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<SessionResult, SessionError>;
}

/// Drives a command through up to `max_attempts` attempts.
pub struct RetryController<R> {
    policy: RetryPolicy,
    runner: R,
}

impl<R: AttemptRunner> RetryController<R> {
    pub fn new(policy: RetryPolicy, runner: R) -> Self {
        Self { policy, runner }
    }

    /// Run `command` until it succeeds, fails terminally, or attempts run out.
    ///
    /// Spawn and wait failures abort immediately; they are not retried.
    pub async fn execute(&mut self, command: &str) -> Result<Verdict, SessionError> {
        let policy = &self.policy;
        let mut state = RunState::new(policy);

        while state.has_remaining(policy) {
            let timeout = state.effective_timeout(policy);
            info!(
                command,
                timeout = %describe_timeout(timeout),
                attempt = state.attempt() + 1,
                max_attempts = policy.max_attempts,
                "executing command"
            );

            let result = self.runner.run(command, timeout).await?;

            if !result.timed_out {
                info!(
                    pid = result.pid,
                    elapsed_secs = result.duration.as_secs(),
                    exit_code = ?result.exit_code,
                    "command finished"
                );
            }

            match evaluate(policy, &result) {
                AttemptDecision::Succeed => return Ok(Verdict::Succeeded),
                AttemptDecision::Fail { exit_code } => {
                    error!(exit_code, "command failed, not retrying");
                    return Ok(Verdict::Failed { exit_code });
                }
                AttemptDecision::Retry(RetryReason::TimedOut) => {
                    warn!(
                        timeout = %describe_timeout(timeout),
                        "command timed out"
                    );
                }
                AttemptDecision::Retry(RetryReason::OutputMatched(needle)) => {
                    warn!(
                        pattern = %needle,
                        "found retry output in command output, retrying despite error code"
                    );
                }
            }

            if !state.is_last(policy) {
                if policy.progressive {
                    let mut next = state.clone();
                    next.advance(policy);
                    info!(
                        next_timeout = %describe_timeout(next.effective_timeout(policy)),
                        "increasing timeout and trying again"
                    );
                } else {
                    info!("trying again");
                }
            }
            state.advance(policy);
        }

        error!(
            attempts = policy.max_attempts,
            "command never finished successfully"
        );
        Ok(Verdict::Exhausted {
            attempts: policy.max_attempts,
        })
    }
}
