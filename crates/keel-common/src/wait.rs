//! Readiness Waiter: bounded polling with backoff and jitter.
//!
//! Every wait in the lifecycle core goes through [`wait_until`]. A check
//! returns `Ok(true)` when the condition holds, `Ok(false)` to keep polling,
//! `Err(PollError::Transient)` to remember an error and keep polling, or
//! `Err(PollError::Fatal)` to stop immediately. When the budget runs out the
//! last remembered error is returned, otherwise a timeout error.
//!
//! Waits honour the invocation's [`CancellationToken`]; cancelling aborts the
//! sleep and leaves any external resources in place for a resumed run.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{Error, Result};

/// Polling schedule
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Number of checks before giving up
    pub steps: u32,
    /// Delay after the first check
    pub duration: Duration,
    /// Multiplier applied to the delay after each check
    pub factor: f64,
    /// Upper bound of the random fraction added to each delay
    pub jitter: f64,
}

impl Default for Backoff {
    /// 60 checks, 5s apart: roughly a five minute budget
    fn default() -> Self {
        Self {
            steps: 60,
            duration: Duration::from_secs(5),
            factor: 1.0,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// Fixed-interval schedule without jitter
    pub fn fixed(steps: u32, interval: Duration) -> Self {
        Self {
            steps,
            duration: interval,
            factor: 1.0,
            jitter: 0.0,
        }
    }

    /// Schedule for waiting on Velero to sync backups from the store (150s)
    pub fn backup_listing() -> Self {
        Self::fixed(30, Duration::from_secs(5))
    }

    /// Schedule for node-level operations such as artifact jobs and plans
    pub fn long_running() -> Self {
        Self {
            steps: 720,
            ..Self::default()
        }
    }

    /// Sum of the un-jittered delays
    pub fn budget(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut delay = self.duration;
        for _ in 1..self.steps {
            total += delay;
            delay = delay.mul_f64(self.factor);
        }
        total
    }
}

/// Outcome of a failed check
#[derive(Debug)]
pub enum PollError {
    /// Remembered and retried
    Transient(Error),
    /// Ends the wait immediately
    Fatal(Error),
}

impl From<Error> for PollError {
    fn from(e: Error) -> Self {
        PollError::Transient(e)
    }
}

/// Result type returned by a wait check
pub type PollResult = std::result::Result<bool, PollError>;

/// Side channel for human-readable progress while waiting
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait ProgressSink: Send + Sync {
    /// Report the latest progress line
    fn report(&self, message: &str);
}

/// Progress sink that emits tracing events
#[derive(Clone, Copy, Debug, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, message: &str) {
        info!(progress = %message, "waiting");
    }
}

/// Poll `check` on the `backoff` schedule until it reports done.
pub async fn wait_until<F, Fut>(
    cancel: &CancellationToken,
    backoff: &Backoff,
    operation: &str,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult>,
{
    let mut delay = backoff.duration;
    let mut last_err: Option<Error> = None;

    for step in 0..backoff.steps {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                operation: operation.to_string(),
            });
        }

        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(PollError::Transient(e)) => {
                debug!(operation = %operation, step, error = %e, "check failed, will retry");
                last_err = Some(e);
            }
            Err(PollError::Fatal(e)) => return Err(e),
        }

        if step + 1 == backoff.steps {
            break;
        }

        let sleep_for = jittered(delay, backoff.jitter);
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled { operation: operation.to_string() });
            }
            _ = tokio::time::sleep(sleep_for) => {}
        }
        delay = delay.mul_f64(backoff.factor);
    }

    Err(last_err.unwrap_or_else(|| {
        Error::timeout(
            operation,
            format!("condition not met after {} checks", backoff.steps),
        )
    }))
}

/// Poll a set of named sub-checks until all of them hold, reporting
/// "`<label>`: n/total ready" through `progress` after every round.
pub async fn wait_until_all<F, Fut>(
    cancel: &CancellationToken,
    backoff: &Backoff,
    label: &str,
    names: &[String],
    progress: &dyn ProgressSink,
    mut check: F,
) -> Result<()>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = PollResult>,
{
    let total = names.len();
    wait_until(cancel, backoff, label, || {
        let pending: Vec<Fut> = names.iter().map(|n| check(n.clone())).collect();
        async move {
            let mut ready = 0;
            let mut last_err = None;
            for fut in pending {
                match fut.await {
                    Ok(true) => ready += 1,
                    Ok(false) => {}
                    Err(PollError::Transient(e)) => last_err = Some(e),
                    Err(fatal @ PollError::Fatal(_)) => return Err(fatal),
                }
            }
            progress.report(&format!("{}: {}/{} ready", label, ready, total));
            match last_err {
                Some(e) if ready < total => Err(PollError::Transient(e)),
                _ => Ok(ready == total),
            }
        }
    })
    .await
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0.0..jitter);
    delay.mul_f64(1.0 + extra)
}
