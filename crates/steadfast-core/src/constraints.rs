//! Wall-clock deadline tracking across all models and retries.

use std::time::{Duration, Instant};
use thiserror::Error;

/// The total timeout elapsed before any model succeeded.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Total timeout of {:.2}s exceeded after {:.2}s", .timeout.as_secs_f64(), .elapsed.as_secs_f64())]
pub struct TotalTimeoutError {
    /// The configured budget
    pub timeout: Duration,

    /// Time actually spent when the violation was detected
    pub elapsed: Duration,
}

/// Deadline derived from an optional total-timeout budget.
///
/// The clock starts when the constraints are created.
#[derive(Debug, Clone)]
pub struct ExecutionConstraints {
    started_at: Instant,
    total_timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl ExecutionConstraints {
    /// Start the clock with an optional total timeout.
    pub fn new(total_timeout: Option<Duration>) -> Self {
        let started_at = Instant::now();
        let deadline = total_timeout.and_then(|t| started_at.checked_add(t));
        Self {
            started_at,
            total_timeout,
            deadline,
        }
    }

    /// Whether a total timeout was configured.
    pub fn has_timeout(&self) -> bool {
        self.deadline.is_some()
    }

    /// The configured total timeout.
    pub fn total_timeout(&self) -> Option<Duration> {
        self.total_timeout
    }

    /// The instant after which attempts are refused.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// When the clock started.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Time since construction.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time left before the deadline, never negative. `None` without a timeout.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has been reached. Always false without a timeout.
    pub fn timeout_exceeded(&self) -> bool {
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Fail with [`TotalTimeoutError`] if the deadline has been reached.
    pub fn enforce_timeout(&self) -> Result<(), TotalTimeoutError> {
        match self.total_timeout {
            Some(timeout) if self.timeout_exceeded() => Err(TotalTimeoutError {
                timeout,
                elapsed: self.elapsed(),
            }),
            _ => Ok(()),
        }
    }
}
