//! Append-only log of the attempts made during one execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::error::{Classify, ErrorClass};

/// Reason recorded when a model is skipped because its circuit is open.
pub const CIRCUIT_OPEN: &str = "circuit open";

/// What happened to one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Started, no result recorded yet
    Pending,

    /// The model produced a result
    Succeeded,

    /// The model raised an error
    Failed { error: String, class: ErrorClass },

    /// The model was never called
    ShortCircuited { reason: String },
}

/// One entry of the attempt log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// Model identifier
    pub model: String,

    /// Wall-clock start
    pub started_at: DateTime<Utc>,

    /// How long the call took (absent for pending and short-circuited entries)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Result of the attempt
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl Attempt {
    /// Whether this entry is a real call (not a short-circuit marker).
    pub fn is_real(&self) -> bool {
        !matches!(self.outcome, AttemptOutcome::ShortCircuited { .. })
    }

    /// Whether the attempt succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Succeeded)
    }

    /// Whether the model was skipped.
    pub fn is_short_circuit(&self) -> bool {
        !self.is_real()
    }

    /// Error message of a failed attempt.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            AttemptOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Handle to an attempt started on an [`AttemptTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptId(usize);

/// Ordered history of attempts for one execution.
#[derive(Debug, Default)]
pub struct AttemptTracker {
    attempts: Vec<Attempt>,
    clocks: Vec<Option<Instant>>,
}

impl AttemptTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a real attempt against `model`.
    pub fn start(&mut self, model: &str) -> AttemptId {
        self.attempts.push(Attempt {
            model: model.to_string(),
            started_at: Utc::now(),
            duration_ms: None,
            outcome: AttemptOutcome::Pending,
        });
        self.clocks.push(Some(Instant::now()));
        AttemptId(self.attempts.len() - 1)
    }

    /// Mark an attempt as successful.
    pub fn record_success(&mut self, id: AttemptId) {
        self.finish(id, AttemptOutcome::Succeeded);
    }

    /// Mark an attempt as failed with `error`.
    pub fn record_failure(&mut self, id: AttemptId, error: &dyn Classify) {
        self.finish(
            id,
            AttemptOutcome::Failed {
                error: error.to_string(),
                class: error.class(),
            },
        );
    }

    /// Record that `model` was skipped because its circuit is open.
    pub fn record_short_circuit(&mut self, model: &str) {
        self.attempts.push(Attempt {
            model: model.to_string(),
            started_at: Utc::now(),
            duration_ms: None,
            outcome: AttemptOutcome::ShortCircuited {
                reason: CIRCUIT_OPEN.to_string(),
            },
        });
        self.clocks.push(None);
    }

    fn finish(&mut self, id: AttemptId, outcome: AttemptOutcome) {
        let Some(attempt) = self.attempts.get_mut(id.0) else {
            return;
        };
        attempt.outcome = outcome;
        attempt.duration_ms = self.clocks[id.0]
            .map(|start| u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX));
    }

    /// All entries in order.
    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    /// Number of entries, short-circuits included.
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Distinct models that received at least one real call, in order.
    pub fn models_attempted(&self) -> Vec<String> {
        let mut models: Vec<String> = Vec::new();
        for attempt in self.attempts.iter().filter(|a| a.is_real()) {
            if !models.contains(&attempt.model) {
                models.push(attempt.model.clone());
            }
        }
        models
    }

    /// The successful attempt, if any.
    pub fn successful_attempt(&self) -> Option<&Attempt> {
        self.attempts.iter().find(|a| a.is_success())
    }

    /// Number of failed calls.
    pub fn failed_count(&self) -> usize {
        self.attempts.iter().filter(|a| a.error().is_some()).count()
    }

    /// Number of skipped models.
    pub fn short_circuited_count(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_short_circuit()).count()
    }

    /// Number of real calls made.
    pub fn call_count(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_real()).count()
    }

    /// Time spent inside calls, excluding backoff sleeps.
    pub fn total_duration(&self) -> Duration {
        let millis = self.attempts.iter().filter_map(|a| a.duration_ms).sum();
        Duration::from_millis(millis)
    }

    /// Consume the tracker, keeping the log.
    pub fn into_attempts(self) -> Vec<Attempt> {
        self.attempts
    }
}
