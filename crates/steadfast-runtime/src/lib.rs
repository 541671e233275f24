//! # steadfast-runtime
//!
//! Reliability execution engine for LLM calls.
//!
//! This crate composes the policies from `steadfast-core` into an
//! [`Executor`] that runs a caller-supplied attempt against a fallback chain
//! of models, with:
//! - per-model retries with backoff
//! - circuit breakers shared across executors through a [`CounterStore`]
//! - a total deadline spanning every model and retry
//! - optional budget checks before every attempt
//!
//! The executor never talks to a provider itself. The callback performs one
//! attempt against the model it is handed and returns `Err` on failure.
//!
//! ## Example
//!
//! ```rust,ignore
//! use steadfast_core::{LlmError, ReliabilityConfig};
//! use steadfast_runtime::Executor;
//!
//! let config = ReliabilityConfig::from_yaml_file("reliability.yaml")?;
//! let executor = Executor::new(config, "claude-sonnet-4-5", "SummaryAgent", None)?;
//!
//! let result = executor
//!     .execute(|model| async move { client.complete(&model, &prompt).await })
//!     .await?;
//!
//! println!("{} answered after {} attempts", result.model, result.attempts.len());
//! ```

pub mod alerts;
pub mod executor;
pub mod resilience;
pub mod sleep;
pub mod store;

// Re-export main types at crate root
pub use alerts::{Alert, AlertError, AlertSink, MemoryAlertSink, TracingAlertSink};
pub use executor::{Execution, ExecutionError, Executor};
pub use resilience::{
    BreakerManager, BreakerStatus, BudgetConfig, BudgetExceeded, BudgetGuard, BudgetLimits,
    BudgetScope, BudgetUsage, CircuitBreaker, CounterBudget, Enforcement, Spend,
};
pub use sleep::{BlockingSleeper, Sleeper, TokioSleeper};
pub use store::{
    CasCounterStore, CasStore, CounterStore, MemoryCounterStore, StoreError, Versioned,
};
