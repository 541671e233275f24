//! Backoff sleeping.
//!
//! Async callers want a sleep that yields to the scheduler so other tasks
//! keep running; synchronous callers want a plain thread sleep.

use async_trait::async_trait;
use std::time::Duration;

/// Waits out a backoff delay.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Wait for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Yields to the Tokio scheduler while waiting.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Blocks the current thread while waiting.
///
/// Only for executions driven with `execute_blocking`; inside an async
/// runtime this stalls every task sharing the worker thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingSleeper;

#[async_trait]
impl Sleeper for BlockingSleeper {
    async fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
