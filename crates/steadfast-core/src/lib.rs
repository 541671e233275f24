//! # steadfast-core
//!
//! Deterministic reliability policies for LLM calls.
//!
//! This crate holds the pieces of the reliability engine that need no
//! async runtime and no shared state:
//! - [`RetryStrategy`]: when to retry and how long to back off
//! - [`FallbackRouting`]: the ordered, deduplicated chain of models
//! - [`ExecutionConstraints`]: the total-timeout deadline
//! - [`AttemptTracker`]: the audit log of one execution
//! - [`ReliabilityConfig`]: the immutable policy, parsed and validated
//!
//! The executor that composes them, together with circuit breakers and
//! budgets, lives in `steadfast-runtime`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use steadfast_core::{FallbackRouting, ReliabilityConfig, RetryStrategy};
//!
//! let config = ReliabilityConfig::from_yaml_file("reliability.yaml")?;
//! let retry = RetryStrategy::from_config(&config.retries)?;
//! let routing = FallbackRouting::new("claude-sonnet-4-5", &config.fallback_models);
//!
//! for attempt in 0..retry.max_retries() {
//!     println!("retry {} waits ~{:?}", attempt, retry.deterministic_delay_for(attempt));
//! }
//! println!("chain: {:?}", routing.models());
//! ```

pub mod attempts;
pub mod config;
pub mod constraints;
pub mod error;
pub mod retry;
pub mod routing;

// Re-export main types at crate root
pub use attempts::{Attempt, AttemptId, AttemptOutcome, AttemptTracker, CIRCUIT_OPEN};
pub use config::{
    Backoff, CircuitBreakerConfig, ConfigError, ReliabilityConfig, RetryConfig, RetryMode,
};
pub use constraints::{ExecutionConstraints, TotalTimeoutError};
pub use error::{Classify, EmptyResponse, ErrorClass, LlmError};
pub use retry::RetryStrategy;
pub use routing::FallbackRouting;
