//! Shared counter store used for circuit breaker and budget state.
//!
//! Many executors may run at once and update the same counters, so the
//! store must increment atomically. [`MemoryCounterStore`] does so under a
//! lock; backends that only offer compare-and-swap get atomic increments
//! through [`CasCounterStore`].

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

mod cas;
mod memory;

pub use cas::{CasCounterStore, CasStore, Versioned};
pub use memory::MemoryCounterStore;

/// Errors from a counter store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    #[error("Gave up updating {key} after {attempts} contended attempts")]
    Contention { key: String, attempts: u32 },
}

/// Named integer counters with optional expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `amount` to `key` and return the new value.
    ///
    /// A missing or expired key starts from zero. `ttl` applies only when
    /// the key is created, so a window opened by the first increment is not
    /// extended by later ones.
    async fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>)
        -> Result<i64, StoreError>;

    /// Current value of `key`, or `None` if missing or expired.
    async fn read(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Overwrite `key`, resetting its expiry.
    async fn write(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), StoreError>;
}
