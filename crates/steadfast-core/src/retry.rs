//! Retry policy: when to retry and how long to wait.

use rand::Rng;
use regex::Regex;
use std::collections::HashSet;
use std::time::Duration;

use crate::config::{Backoff, ConfigError, RetryConfig};
use crate::error::{Classify, ErrorClass};

/// Upper bound of the random extra delay, as a fraction of the base delay.
const JITTER_FACTOR: f64 = 0.5;

/// Immutable retry policy compiled from a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    max: u32,
    backoff: Backoff,
    base: Duration,
    max_delay: Duration,
    retryable_kinds: HashSet<String>,
    patterns: Vec<Regex>,
}

impl RetryStrategy {
    /// Compile a strategy from config.
    pub fn from_config(config: &RetryConfig) -> Result<Self, ConfigError> {
        let patterns = config
            .patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            max: config.max,
            backoff: config.backoff,
            base: config.base,
            max_delay: config.max_delay,
            retryable_kinds: config.on.iter().cloned().collect(),
            patterns,
        })
    }

    /// Strategy that never retries.
    pub fn none() -> Self {
        Self {
            max: 0,
            backoff: Backoff::Constant,
            base: Duration::ZERO,
            max_delay: Duration::ZERO,
            retryable_kinds: HashSet::new(),
            patterns: Vec::new(),
        }
    }

    /// Maximum retries per model.
    pub fn max_retries(&self) -> u32 {
        self.max
    }

    /// Whether another retry is allowed after the attempt at `attempt_index`.
    pub fn should_retry(&self, attempt_index: u32) -> bool {
        attempt_index < self.max
    }

    /// The delay before the retry that follows `attempt_index`, without jitter.
    pub fn deterministic_delay_for(&self, attempt_index: u32) -> Duration {
        match self.backoff {
            Backoff::Exponential => {
                let factor = 2f64.powi(attempt_index.min(i32::MAX as u32) as i32);
                let secs = self.base.as_secs_f64() * factor;
                let capped = secs.min(self.max_delay.as_secs_f64());
                Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
            }
            Backoff::Constant | Backoff::Unknown => self.base,
        }
    }

    /// The delay before the retry that follows `attempt_index`.
    ///
    /// The deterministic part is capped at `max_delay` first; jitter then adds
    /// up to 50% on top, so the result may exceed `max_delay` by that much.
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        with_jitter(self.deterministic_delay_for(attempt_index), jitter)
    }

    /// The longest delay [`delay_for`](Self::delay_for) can return for `attempt_index`.
    pub fn max_jittered_delay_for(&self, attempt_index: u32) -> Duration {
        with_jitter(self.deterministic_delay_for(attempt_index), 1.0)
    }

    /// Whether `error` may be retried against the same model.
    pub fn is_retryable(&self, error: &dyn Classify) -> bool {
        match error.class() {
            ErrorClass::Fatal => false,
            ErrorClass::Transient => true,
            ErrorClass::Permanent => {
                if self.retryable_kinds.contains(error.kind()) {
                    return true;
                }
                if self.patterns.is_empty() {
                    return false;
                }
                let message = error.to_string();
                self.patterns.iter().any(|p| p.is_match(&message))
            }
        }
    }

    /// Whether `error` must stop the whole execution.
    pub fn is_fatal(&self, error: &dyn Classify) -> bool {
        error.class() == ErrorClass::Fatal
    }
}

/// Add `jitter` (in `[0, 1]`) times half of `delay`, saturating at `Duration::MAX`.
fn with_jitter(delay: Duration, jitter: f64) -> Duration {
    let secs = delay.as_secs_f64() * (1.0 + jitter * JITTER_FACTOR);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

impl Default for RetryStrategy {
    fn default() -> Self {
        // Defaults are valid patterns, compilation cannot fail
        Self::from_config(&RetryConfig::default()).unwrap_or_else(|_| Self::none())
    }
}
