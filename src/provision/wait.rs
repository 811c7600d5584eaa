//! Bounded polling: daemon readiness and package-manager lock contention.
//!
//! Both helpers sit on [`wait_for`], a fixed-interval loop with an attempt
//! cap, an optional wall-clock deadline and a [`CancelToken`] that is
//! checked before every attempt and while sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, warn};

use crate::error::ProvisionError;
use crate::runner::Runner;

/// Lists listening TCP sockets with whichever tool the host has.
pub const LISTENING_SOCKETS_COMMAND: &str =
    "if ! type netstat 1>/dev/null; then ss -tln; else netstat -tln; fi";

/// Output fragments that mean another process holds the package manager lock.
const LOCK_BUSY_SIGNATURES: &[&str] =
    &["Could not get lock", "Unable to acquire the dpkg frontend lock"];

/// Longest single sleep between cancellation checks.
const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(100);

/// Shared flag a caller flips to abandon a polling loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Attempt budget for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub attempts: u32,
    /// Fixed delay between attempts; there is no backoff growth.
    pub interval: Duration,
    /// Optional cap on total elapsed time.
    pub deadline: Option<Duration>,
}

impl WaitPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            interval,
            deadline: None,
        }
    }

    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Daemon readiness: 10 polls, 3 seconds apart.
    pub const fn daemon() -> Self {
        Self::new(10, Duration::from_secs(3))
    }

    /// Lock contention and SSH reachability: 60 polls, 3 seconds apart.
    pub const fn standard() -> Self {
        Self::new(60, Duration::from_secs(3))
    }
}

/// How a polling loop ended when it was not cancelled or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready { attempts: u32 },
    Exhausted { attempts: u32 },
}

/// Polls `check` until it reports ready or the policy is spent.
///
/// `check` receives the 1-based attempt number and returns `Ok(true)` when
/// done, `Ok(false)` to retry, or `Err` to abort immediately. No sleep
/// follows the final attempt.
pub fn wait_for<F>(
    policy: &WaitPolicy,
    cancel: &CancelToken,
    mut check: F,
) -> Result<WaitOutcome, ProvisionError>
where
    F: FnMut(u32) -> Result<bool, ProvisionError>,
{
    let started = Instant::now();
    let mut attempts = 0;

    while attempts < policy.attempts {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled(format!(
                "cancelled after {} attempt(s)",
                attempts
            )));
        }
        attempts += 1;
        if check(attempts)? {
            return Ok(WaitOutcome::Ready { attempts });
        }
        if attempts == policy.attempts {
            break;
        }
        if let Some(deadline) = policy.deadline
            && started.elapsed() + policy.interval > deadline
        {
            debug!("deadline of {:?} reached after {} attempt(s)", deadline, attempts);
            break;
        }
        sleep_unless_cancelled(policy.interval, cancel);
    }

    Ok(WaitOutcome::Exhausted { attempts })
}

fn sleep_unless_cancelled(interval: Duration, cancel: &CancelToken) {
    let until = Instant::now() + interval;
    loop {
        let now = Instant::now();
        if now >= until || cancel.is_cancelled() {
            return;
        }
        thread::sleep((until - now).min(CANCEL_CHECK_SLICE));
    }
}

/// Returns true if any line of socket-listing output shows `port` listening.
pub fn match_listening(output: &str, port: u16) -> bool {
    let pattern = format!(r":{}\s+.*:.*", port);
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(e) => {
            warn!("invalid listening pattern {:?}: {}", pattern, e);
            return false;
        }
    };
    output.lines().any(|line| !line.is_empty() && re.is_match(line))
}

/// Waits until something listens on `port` on the host behind `runner`.
///
/// A failed listing command counts as "not yet". Returns the number of
/// polls it took.
pub fn wait_for_daemon(
    runner: &dyn Runner,
    port: u16,
    policy: &WaitPolicy,
    cancel: &CancelToken,
) -> Result<u32, ProvisionError> {
    let outcome = wait_for(policy, cancel, |attempt| {
        match runner.run(LISTENING_SOCKETS_COMMAND) {
            Ok(result) if result.success() => Ok(match_listening(&result.stdout, port)),
            Ok(result) => {
                warn!(attempt, "listing sockets failed: {}", result.failure_summary());
                Ok(false)
            }
            Err(e) => {
                warn!(attempt, "error running ssh command: {:#}", e);
                Ok(false)
            }
        }
    })?;

    match outcome {
        WaitOutcome::Ready { attempts } => {
            debug!("daemon is listening on port {} after {} poll(s)", port, attempts);
            Ok(attempts)
        }
        WaitOutcome::Exhausted { attempts } => {
            Err(ProvisionError::DaemonNotAvailable { port, attempts })
        }
    }
}

/// Classifies command output as package-manager lock contention.
pub fn is_lock_contention(output: &str) -> bool {
    LOCK_BUSY_SIGNATURES.iter().any(|sig| output.contains(sig))
}

/// Runs `command` until it stops failing on a busy package-manager lock.
///
/// Lock contention is retried within `policy`; any other failure is
/// returned at once. Returns the command's stdout.
pub fn wait_for_lock(
    runner: &dyn Runner,
    command: &str,
    policy: &WaitPolicy,
    cancel: &CancelToken,
) -> Result<String, ProvisionError> {
    let mut stdout = String::new();
    let outcome = wait_for(policy, cancel, |attempt| {
        let result = runner.run(command).map_err(|source| ProvisionError::Transport {
            command: command.to_string(),
            source,
        })?;
        if result.success() {
            stdout = result.stdout;
            return Ok(true);
        }
        let summary = result.failure_summary();
        if is_lock_contention(&summary) {
            debug!(attempt, "lock busy, retrying: {}", command);
            return Ok(false);
        }
        Err(ProvisionError::Command {
            command: command.to_string(),
            status: summary,
        })
    })?;

    match outcome {
        WaitOutcome::Ready { .. } => Ok(stdout),
        WaitOutcome::Exhausted { attempts } => Err(ProvisionError::LockTimeout {
            command: command.to_string(),
            attempts,
        }),
    }
}
