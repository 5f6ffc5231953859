//! Automatic error recovery strategies.
//!
//! Stall detection for the acquisition source and bounded restarts of the
//! whole pipeline. A source that stops delivering trips the
//! [`StallMonitor`]; the [`Supervisor`] then performs stop, reconfigure and
//! restart cycles through [`Restartable`], retrying each one according to a
//! [`RetryPolicy`] and giving up once the reset budget is spent.

use crate::error::{AppResult, OctError};
use std::thread::sleep;
use std::time::Duration;
use tracing::{info, warn};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of attempts.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

/// An object that can be stopped, reconfigured and started again.
pub trait Restartable {
    /// Stop, reconfigure and start again.
    fn restart(&mut self) -> AppResult<()>;
}

/// Run `operation` until it succeeds or the policy runs out, returning the
/// last error. The attempt number (from 1) is passed in.
pub fn retry_with_policy<T>(
    policy: &RetryPolicy,
    mut operation: impl FnMut(u32) -> AppResult<T>,
) -> AppResult<T> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                warn!(attempt, error = %err, "Attempt failed, retrying");
                sleep(policy.backoff_delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Result of recording one raw-buffer wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallStatus {
    /// The last wait delivered a buffer.
    Healthy,
    /// Timed out, still below the threshold.
    Waiting {
        /// Timeouts in a row.
        consecutive: u32,
    },
    /// Threshold reached: the source is considered hung.
    Stalled {
        /// Timeouts in a row.
        consecutive: u32,
    },
}

/// Counts consecutive raw-buffer waits that time out.
#[derive(Debug, Clone)]
pub struct StallMonitor {
    threshold: u32,
    consecutive: u32,
    total: u64,
}

impl StallMonitor {
    /// Monitor that stalls after `threshold` consecutive timeouts (at least 1).
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
            total: 0,
        }
    }

    /// Record one timed-out wait.
    pub fn record_timeout(&mut self) -> StallStatus {
        self.consecutive = self.consecutive.saturating_add(1);
        self.total += 1;
        if self.consecutive >= self.threshold {
            StallStatus::Stalled {
                consecutive: self.consecutive,
            }
        } else {
            StallStatus::Waiting {
                consecutive: self.consecutive,
            }
        }
    }

    /// Record a delivered buffer, clearing the consecutive count.
    pub fn record_success(&mut self) -> StallStatus {
        self.consecutive = 0;
        StallStatus::Healthy
    }

    /// Current run of timeouts.
    #[must_use]
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Timeouts seen since creation.
    #[must_use]
    pub fn total_timeouts(&self) -> u64 {
        self.total
    }

    /// Consecutive timeouts that count as a stall.
    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

/// Performs bounded restarts.
#[derive(Debug, Clone)]
pub struct Supervisor {
    policy: RetryPolicy,
    max_resets: u32,
    resets: u32,
}

impl Supervisor {
    /// Allow at most `max_resets` reset cycles, each retried per `policy`.
    #[must_use]
    pub fn new(policy: RetryPolicy, max_resets: u32) -> Self {
        Self {
            policy,
            max_resets,
            resets: 0,
        }
    }

    /// One reset cycle. Fails with [`OctError::ResetLimitExceeded`] once
    /// `max_resets` cycles have already been spent, or with the restart
    /// error if every retry of this cycle failed.
    pub fn recover<R: Restartable + ?Sized>(&mut self, target: &mut R) -> AppResult<()> {
        if self.resets >= self.max_resets {
            warn!(resets = self.resets, "Reset budget exhausted");
            return Err(OctError::ResetLimitExceeded(self.max_resets));
        }
        self.resets += 1;
        info!(reset = self.resets, max = self.max_resets, "Resetting acquisition pipeline");
        retry_with_policy(&self.policy, |_| target.restart())
    }

    /// Reset cycles performed so far.
    #[must_use]
    pub fn resets(&self) -> u32 {
        self.resets
    }
}
