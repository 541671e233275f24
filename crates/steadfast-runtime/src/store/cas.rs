//! Atomic increments for backends that only offer compare-and-swap.

use async_trait::async_trait;
use std::time::Duration;

use super::{CounterStore, StoreError};

/// Default bound on compare-and-swap retries per increment.
const DEFAULT_MAX_ATTEMPTS: u32 = 16;

/// A value together with the version it was read at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Versioned {
    pub value: i64,
    pub version: u64,
}

/// Minimal contract of a versioned key-value backend.
#[async_trait]
pub trait CasStore: Send + Sync {
    /// Current value and version of `key`, or `None` if missing or expired.
    async fn read_versioned(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Store `value` only if `key` is still at `expected` (`None`: still absent).
    ///
    /// `ttl` is applied when the key is created; an update keeps the
    /// existing expiry. Returns `false` when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: i64,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Unconditionally store `value`, resetting the expiry.
    async fn put(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), StoreError>;
}

/// [`CounterStore`] over a [`CasStore`], incrementing with a bounded CAS loop.
///
/// Never falls back to a plain read-modify-write: if the loop bound is hit
/// the increment fails with [`StoreError::Contention`].
#[derive(Debug)]
pub struct CasCounterStore<S> {
    inner: S,
    max_attempts: u32,
}

impl<S: CasStore> CasCounterStore<S> {
    /// Wrap a CAS backend.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Set the CAS retry bound (at least 1).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: CasStore> CounterStore for CasCounterStore<S> {
    async fn increment(
        &self,
        key: &str,
        amount: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        for attempt in 1..=self.max_attempts {
            let current = self.inner.read_versioned(key).await?;
            let next = current.map_or(amount, |c| c.value.saturating_add(amount));
            let expected = current.map(|c| c.version);

            if self.inner.compare_and_swap(key, expected, next, ttl).await? {
                return Ok(next);
            }

            tracing::debug!(key, attempt, "Counter update contended, retrying");
        }

        Err(StoreError::Contention {
            key: key.to_string(),
            attempts: self.max_attempts,
        })
    }

    async fn read(&self, key: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.inner.read_versioned(key).await?.map(|v| v.value))
    }

    async fn write(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.inner.put(key, value, ttl).await
    }
}
