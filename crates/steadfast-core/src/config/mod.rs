//! Reliability configuration: parsing, schema validation, defaults.

mod parser;
pub mod schema;

pub use parser::{Backoff, CircuitBreakerConfig, ConfigError, ReliabilityConfig, RetryConfig, RetryMode};
