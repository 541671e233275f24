//! Executor: runs one logical LLM call under the reliability policy.
//!
//! The executor walks the fallback chain in order. Models with an open
//! circuit are skipped without spending retries. Each remaining model gets
//! a retry loop that checks the total deadline and the budget before every
//! attempt. The first success wins; otherwise the call ends with exactly one
//! [`ExecutionError`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use steadfast_core::{
    Attempt, AttemptTracker, Classify, ConfigError, EmptyResponse, ExecutionConstraints,
    FallbackRouting, ReliabilityConfig, RetryMode, RetryStrategy,
};

use crate::alerts::{AlertSink, TracingAlertSink};
use crate::resilience::{BreakerManager, BudgetExceeded, BudgetGuard, BudgetScope};
use crate::sleep::{BlockingSleeper, Sleeper, TokioSleeper};
use crate::store::{CounterStore, MemoryCounterStore};

/// Terminal failure of an execution.
///
/// Individual attempt failures never surface on their own; they are in
/// `attempts`.
#[derive(Error, Debug)]
pub enum ExecutionError<E> {
    /// The total deadline passed before any model succeeded.
    #[error(
        "Total timeout of {:.2}s exceeded after {:.2}s",
        .timeout.as_secs_f64(),
        .elapsed.as_secs_f64()
    )]
    TotalTimeout {
        timeout: Duration,
        elapsed: Duration,
        models_tried: Vec<String>,
        attempts: Vec<Attempt>,
    },

    /// Every model failed or was skipped.
    #[error("All models exhausted: {}", .models_tried.join(", "))]
    AllModelsExhausted {
        models_tried: Vec<String>,
        last_error: Option<E>,
        attempts: Vec<Attempt>,
    },

    /// A hard budget cap refused the next attempt.
    #[error("{exceeded}")]
    BudgetExceeded {
        exceeded: BudgetExceeded,
        models_tried: Vec<String>,
        attempts: Vec<Attempt>,
    },

    /// A fatal error from the callback stopped the call.
    ///
    /// The failing model's circuit breaker is not charged: a fatal error
    /// describes the request, not the health of the model.
    #[error("Execution aborted on {model}: {error}")]
    Aborted {
        model: String,
        error: E,
        models_tried: Vec<String>,
        attempts: Vec<Attempt>,
    },
}

impl<E> ExecutionError<E> {
    /// Attempt log up to the failure.
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            ExecutionError::TotalTimeout { attempts, .. }
            | ExecutionError::AllModelsExhausted { attempts, .. }
            | ExecutionError::BudgetExceeded { attempts, .. }
            | ExecutionError::Aborted { attempts, .. } => attempts,
        }
    }

    /// Models reached in chain order, skipped ones included. A model the
    /// deadline or budget stopped before its first call is left out.
    pub fn models_tried(&self) -> &[String] {
        match self {
            ExecutionError::TotalTimeout { models_tried, .. }
            | ExecutionError::AllModelsExhausted { models_tried, .. }
            | ExecutionError::BudgetExceeded { models_tried, .. }
            | ExecutionError::Aborted { models_tried, .. } => models_tried,
        }
    }

    /// Last error raised by the callback, if any.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            ExecutionError::AllModelsExhausted { last_error, .. } => last_error.as_ref(),
            ExecutionError::Aborted { error, .. } => Some(error),
            _ => None,
        }
    }

    /// True when the chain was exhausted without calling any model because
    /// every circuit was open.
    pub fn is_circuit_open(&self) -> bool {
        match self {
            ExecutionError::AllModelsExhausted { attempts, .. } => {
                !attempts.is_empty() && attempts.iter().all(Attempt::is_short_circuit)
            }
            _ => false,
        }
    }

    /// True for the deadline error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::TotalTimeout { .. })
    }
}

/// A successful execution.
#[derive(Debug, Clone)]
pub struct Execution<T> {
    /// Value returned by the callback
    pub value: T,

    /// Model that produced it
    pub model: String,

    /// Models reached in chain order, the winning one included
    pub models_tried: Vec<String>,

    /// Full attempt log
    pub attempts: Vec<Attempt>,

    /// Wall-clock time of the whole execution
    pub elapsed: Duration,
}

impl<T> Execution<T> {
    /// Discard the report and keep the value.
    pub fn into_value(self) -> T {
        self.value
    }

    /// Number of times the callback was invoked.
    pub fn call_count(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_real()).count()
    }
}

/// Runs one logical call against a fallback chain of models.
///
/// Create one per call; [`execute`](Self::execute) consumes it.
pub struct Executor {
    config: ReliabilityConfig,
    agent_type: String,
    tenant_id: Option<String>,
    retry: RetryStrategy,
    routing: FallbackRouting,
    store: Arc<dyn CounterStore>,
    alerts: Arc<dyn AlertSink>,
    budget: Option<Arc<dyn BudgetGuard>>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("agent_type", &self.agent_type)
            .field("tenant_id", &self.tenant_id)
            .field("models", &self.routing.models())
            .field("budget", &self.budget.is_some())
            .finish()
    }
}

impl Executor {
    /// Create an executor for `primary_model` plus the configured fallbacks.
    ///
    /// Uses the process-wide memory store, alerts to the tracing log and
    /// sleeps on the Tokio timer until overridden with the `with_*` methods.
    pub fn new(
        config: ReliabilityConfig,
        primary_model: impl Into<String>,
        agent_type: impl Into<String>,
        tenant_id: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let primary_model = primary_model.into();
        if primary_model.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "primary model must not be empty".to_string(),
            ));
        }

        config.validate()?;
        let retry = RetryStrategy::from_config(&config.retries)?;
        let routing = FallbackRouting::new(primary_model, &config.fallback_models);

        Ok(Self {
            config,
            agent_type: agent_type.into(),
            tenant_id: tenant_id.map(str::to_string),
            retry,
            routing,
            store: MemoryCounterStore::global(),
            alerts: Arc::new(TracingAlertSink),
            budget: None,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Use a different counter store for breaker state.
    pub fn with_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = store;
        self
    }

    /// Send breaker alerts to `alerts`.
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Check `budget` before every attempt.
    pub fn with_budget(mut self, budget: Arc<dyn BudgetGuard>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Wait out backoff delays with `sleeper`.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// The deduplicated chain, primary first.
    pub fn models_to_try(&self) -> &[String] {
        self.routing.models()
    }

    /// Whether circuit breaking is configured.
    pub fn breakers_enabled(&self) -> bool {
        self.config.circuit_breaker.is_some()
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Run `callback` against the chain until one model succeeds.
    ///
    /// The callback performs exactly one attempt against the model it is
    /// given and reports failure through `Err`.
    pub async fn execute<T, E, F, Fut>(self, callback: F) -> Result<Execution<T>, ExecutionError<E>>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        self.run(callback).await
    }

    /// Like [`execute`](Self::execute) for callbacks that may return no value.
    ///
    /// `Ok(None)` is a failure: it is recorded as [`EmptyResponse`] for that
    /// model and the chain moves on.
    pub async fn execute_optional<T, E, F, Fut>(
        self,
        mut callback: F,
    ) -> Result<Execution<T>, ExecutionError<E>>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Classify + From<EmptyResponse>,
    {
        self.run(move |model: String| {
            let attempt = callback(model.clone());
            async move {
                match attempt.await {
                    Ok(Some(value)) => Ok(value),
                    Ok(None) => Err(E::from(EmptyResponse { model })),
                    Err(e) => Err(e),
                }
            }
        })
        .await
    }

    /// Run a synchronous callback on the current thread.
    ///
    /// Backoff blocks the thread. The counter store and budget must not
    /// need an async runtime to make progress.
    pub fn execute_blocking<T, E, F>(self, mut callback: F) -> Result<Execution<T>, ExecutionError<E>>
    where
        F: FnMut(String) -> Result<T, E>,
        E: Classify,
    {
        let executor = self.with_sleeper(Arc::new(BlockingSleeper));
        futures::executor::block_on(
            executor.run(|model| futures::future::ready(callback(model))),
        )
    }

    async fn run<T, E, F, Fut>(mut self, mut callback: F) -> Result<Execution<T>, ExecutionError<E>>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let constraints = ExecutionConstraints::new(self.config.total_timeout);
        let mut breakers = BreakerManager::new(
            self.agent_type.as_str(),
            self.tenant_id.clone(),
            self.config.circuit_breaker.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.alerts),
        );
        let mut tracker = AttemptTracker::new();
        let scope = BudgetScope::new(self.agent_type.as_str(), self.tenant_id.as_deref());
        let retry_same_model =
            self.config.retry_mode == RetryMode::PerModel || self.routing.len() == 1;
        let mut last_error: Option<E> = None;

        tracing::debug!(
            agent_type = %self.agent_type,
            models = ?self.routing.models(),
            "Starting execution"
        );

        while let Some(model) = self.routing.current_model().map(str::to_string) {
            if breakers.is_open(&model).await {
                tracing::info!(model = %model, "Circuit open, skipping model");
                tracker.record_short_circuit(&model);
                self.routing.advance();
                continue;
            }

            let mut attempt_index: u32 = 0;
            loop {
                if let Err(e) = constraints.enforce_timeout() {
                    tracing::warn!(
                        agent_type = %self.agent_type,
                        elapsed_ms = e.elapsed.as_millis() as u64,
                        "Total timeout exceeded"
                    );
                    return Err(ExecutionError::TotalTimeout {
                        timeout: e.timeout,
                        elapsed: e.elapsed,
                        models_tried: reached_models(&self.routing, attempt_index),
                        attempts: tracker.into_attempts(),
                    });
                }

                if let Some(budget) = &self.budget {
                    if let Err(exceeded) = budget.check(&scope).await {
                        return Err(ExecutionError::BudgetExceeded {
                            exceeded,
                            models_tried: reached_models(&self.routing, attempt_index),
                            attempts: tracker.into_attempts(),
                        });
                    }
                }

                let id = tracker.start(&model);
                tracing::debug!(model = %model, attempt = attempt_index, "Calling model");

                let error = match callback(model.clone()).await {
                    Ok(value) => {
                        tracker.record_success(id);
                        breakers.record_success(&model).await;
                        tracing::debug!(model = %model, "Model succeeded");
                        return Ok(Execution {
                            value,
                            model,
                            models_tried: self.routing.tried_models().to_vec(),
                            attempts: tracker.into_attempts(),
                            elapsed: constraints.elapsed(),
                        });
                    }
                    Err(error) => error,
                };

                tracker.record_failure(id, &error);

                if self.retry.is_fatal(&error) {
                    tracing::error!(model = %model, error = %error, "Fatal error, aborting execution");
                    return Err(ExecutionError::Aborted {
                        model,
                        error,
                        models_tried: self.routing.tried_models().to_vec(),
                        attempts: tracker.into_attempts(),
                    });
                }

                let opened = breakers.record_failure(&model).await;

                let may_retry = retry_same_model
                    && !opened
                    && self.retry.is_retryable(&error)
                    && self.retry.should_retry(attempt_index)
                    && !constraints.timeout_exceeded();

                if may_retry {
                    let delay = self.retry.delay_for(attempt_index);
                    let delay = constraints
                        .remaining()
                        .map_or(delay, |remaining| delay.min(remaining));
                    tracing::info!(
                        model = %model,
                        attempt = attempt_index,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying model"
                    );
                    self.sleeper.sleep(delay).await;
                    attempt_index += 1;
                    continue;
                }

                tracing::warn!(model = %model, error = %error, "Model failed, falling back");
                last_error = Some(error);
                break;
            }

            self.routing.advance();
        }

        tracing::warn!(
            agent_type = %self.agent_type,
            models = ?self.routing.models(),
            "All models exhausted"
        );
        Err(ExecutionError::AllModelsExhausted {
            models_tried: self.routing.tried_models().to_vec(),
            last_error,
            attempts: tracker.into_attempts(),
        })
    }
}

/// Chain prefix up to the current model, which only counts once called.
fn reached_models(routing: &FallbackRouting, attempt_index: u32) -> Vec<String> {
    let tried = routing.tried_models();
    let reached = if attempt_index == 0 {
        tried.len().saturating_sub(1)
    } else {
        tried.len()
    };
    tried[..reached].to_vec()
}
