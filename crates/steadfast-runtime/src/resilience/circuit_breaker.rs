//! Circuit breaker to stop calling a model that keeps failing.
//!
//! State lives in the shared [`CounterStore`], so every executor for the
//! same agent type, model and tenant sees the same circuit. There are no
//! timers: an open circuit is a key whose TTL is the cooldown, and it closes
//! by itself when that key expires.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use steadfast_core::CircuitBreakerConfig;

use crate::alerts::{emit_quietly, Alert, AlertSink};
use crate::store::CounterStore;

const KEY_PREFIX: &str = "steadfast:cb";

/// Snapshot of a breaker for introspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub agent_type: String,
    pub model_id: String,
    pub tenant_id: Option<String>,
    pub errors_threshold: u32,
    pub failure_count: i64,
    pub open: bool,
    pub open_until: Option<DateTime<Utc>>,
}

/// Failure gate for one (agent type, model, tenant).
///
/// Opens when `errors` failures land within `within`, stays open for
/// `cooldown`, then closes on its own. A success clears the failure count.
pub struct CircuitBreaker {
    agent_type: String,
    model_id: String,
    tenant_id: Option<String>,
    config: CircuitBreakerConfig,
    store: Arc<dyn CounterStore>,
    alerts: Arc<dyn AlertSink>,
    failures_key: String,
    open_key: String,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("agent_type", &self.agent_type)
            .field("model_id", &self.model_id)
            .field("tenant_id", &self.tenant_id)
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker.
    pub fn new(
        agent_type: impl Into<String>,
        model_id: impl Into<String>,
        config: CircuitBreakerConfig,
        tenant_id: Option<&str>,
        store: Arc<dyn CounterStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let agent_type = agent_type.into();
        let model_id = model_id.into();
        let tenant_id = tenant_id.map(str::to_string);

        let base = match &tenant_id {
            Some(tenant) => format!("{KEY_PREFIX}:{tenant}:{agent_type}:{model_id}"),
            None => format!("{KEY_PREFIX}:{agent_type}:{model_id}"),
        };

        Self {
            failures_key: format!("{base}:failures"),
            open_key: format!("{base}:open_until"),
            agent_type,
            model_id,
            tenant_id,
            config,
            store,
            alerts,
        }
    }

    /// Create a breaker if circuit breaking is configured, `None` otherwise.
    pub fn from_config(
        agent_type: &str,
        model_id: &str,
        config: Option<&CircuitBreakerConfig>,
        tenant_id: Option<&str>,
        store: Arc<dyn CounterStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Option<Self> {
        config.map(|config| {
            Self::new(agent_type, model_id, config.clone(), tenant_id, store, alerts)
        })
    }

    /// Model this breaker guards.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Breaker policy.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check if the circuit is open.
    ///
    /// Returns true while the cooldown runs. A store failure is logged and
    /// treated as closed so an outage of the store never blocks calls.
    pub async fn is_open(&self) -> bool {
        match self.store.read(&self.open_key).await {
            Ok(Some(until_ms)) => Utc::now().timestamp_millis() < until_ms,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(
                    model = %self.model_id,
                    error = %e,
                    "Circuit state unavailable, treating as closed"
                );
                false
            }
        }
    }

    /// Record a successful call, clearing the failure count.
    pub async fn record_success(&self) {
        if let Err(e) = self
            .store
            .write(&self.failures_key, 0, Some(self.config.within))
            .await
        {
            tracing::warn!(model = %self.model_id, error = %e, "Failed to reset circuit failures");
        }
    }

    /// Record a failed call.
    ///
    /// Returns true if this failure opened the circuit.
    pub async fn record_failure(&self) -> bool {
        let failures = match self
            .store
            .increment(&self.failures_key, 1, Some(self.config.within))
            .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(model = %self.model_id, error = %e, "Failed to record circuit failure");
                return false;
            }
        };

        if failures < i64::from(self.config.errors) {
            tracing::debug!(
                model = %self.model_id,
                failures,
                threshold = self.config.errors,
                "Circuit failure recorded"
            );
            return false;
        }

        // Past the threshold another executor already tripped the circuit
        // unless its cooldown is over.
        if failures > i64::from(self.config.errors) && self.is_open().await {
            tracing::debug!(model = %self.model_id, failures, "Circuit already open");
            return false;
        }

        self.open(failures).await
    }

    async fn open(&self, failures: i64) -> bool {
        let cooldown_ms = i64::try_from(self.config.cooldown.as_millis()).unwrap_or(i64::MAX);
        let open_until = Utc::now().timestamp_millis().saturating_add(cooldown_ms);

        if let Err(e) = self
            .store
            .write(&self.open_key, open_until, Some(self.config.cooldown))
            .await
        {
            tracing::warn!(model = %self.model_id, error = %e, "Failed to open circuit");
            return false;
        }

        // Counting restarts in a fresh window once the cooldown is over
        if let Err(e) = self
            .store
            .write(&self.failures_key, 0, Some(self.config.within))
            .await
        {
            tracing::warn!(model = %self.model_id, error = %e, "Failed to reset circuit failures");
        }

        tracing::warn!(
            agent_type = %self.agent_type,
            model = %self.model_id,
            tenant = ?self.tenant_id,
            failures,
            cooldown = ?self.config.cooldown,
            "Circuit opened after repeated failures"
        );

        emit_quietly(
            self.alerts.as_ref(),
            Alert::CircuitOpened {
                agent_type: self.agent_type.clone(),
                model: self.model_id.clone(),
                tenant_id: self.tenant_id.clone(),
                failures,
                cooldown: self.config.cooldown,
            },
        )
        .await;

        true
    }

    /// Failures counted in the current window.
    pub async fn failure_count(&self) -> i64 {
        self.store
            .read(&self.failures_key)
            .await
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    /// When the open circuit closes, if it is open.
    pub async fn open_until(&self) -> Option<DateTime<Utc>> {
        let until_ms = self.store.read(&self.open_key).await.ok().flatten()?;
        if Utc::now().timestamp_millis() >= until_ms {
            return None;
        }
        DateTime::<Utc>::from_timestamp_millis(until_ms)
    }

    /// Current state of the breaker.
    pub async fn status(&self) -> BreakerStatus {
        let open_until = self.open_until().await;
        BreakerStatus {
            agent_type: self.agent_type.clone(),
            model_id: self.model_id.clone(),
            tenant_id: self.tenant_id.clone(),
            errors_threshold: self.config.errors,
            failure_count: self.failure_count().await,
            open: open_until.is_some(),
            open_until,
        }
    }

    /// Time left in the cooldown, if open.
    pub async fn remaining_cooldown(&self) -> Option<Duration> {
        let until = self.open_until().await?;
        (until - Utc::now()).to_std().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{MemoryAlertSink, TracingAlertSink};
    use crate::store::{MemoryCounterStore, StoreError};
    use async_trait::async_trait;

    fn breaker(errors: u32, cooldown: Duration) -> CircuitBreaker {
        breaker_on(Arc::new(MemoryCounterStore::new()), "m1", None, errors, cooldown)
    }

    fn breaker_on(
        store: Arc<MemoryCounterStore>,
        model: &str,
        tenant: Option<&str>,
        errors: u32,
        cooldown: Duration,
    ) -> CircuitBreaker {
        CircuitBreaker::new(
            "SummaryAgent",
            model,
            CircuitBreakerConfig::new(errors, Duration::from_secs(60), cooldown),
            tenant,
            store,
            Arc::new(TracingAlertSink),
        )
    }

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment(&self, _: &str, _: i64, _: Option<Duration>) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn read(&self, _: &str) -> Result<Option<i64>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn write(&self, _: &str, _: i64, _: Option<Duration>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[test]
    fn test_absent_config_means_no_breaker() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
        let none = CircuitBreaker::from_config(
            "SummaryAgent",
            "m1",
            None,
            None,
            Arc::clone(&store),
            Arc::new(TracingAlertSink),
        );
        assert!(none.is_none());

        let config = CircuitBreakerConfig::default();
        let some = CircuitBreaker::from_config(
            "SummaryAgent",
            "m1",
            Some(&config),
            None,
            store,
            Arc::new(TracingAlertSink),
        );
        assert_eq!(some.unwrap().config().errors, 10);
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let cb = breaker(3, Duration::from_secs(60));
        assert!(!cb.is_open().await);
        assert_eq!(cb.failure_count().await, 0);
    }

    #[tokio::test]
    async fn test_circuit_opens_at_threshold() {
        let cb = breaker(3, Duration::from_secs(60));

        assert!(!cb.record_failure().await);
        assert!(!cb.record_failure().await);
        assert!(!cb.is_open().await);

        assert!(cb.record_failure().await);
        assert!(cb.is_open().await);
        assert!(cb.remaining_cooldown().await.is_some());
    }

    #[tokio::test]
    async fn test_circuit_closes_after_cooldown() {
        let cb = breaker(3, Duration::from_millis(100));

        for _ in 0..3 {
            cb.record_failure().await;
        }
        assert!(cb.is_open().await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!cb.is_open().await);

        // Counting restarts from zero
        assert!(!cb.record_failure().await);
        assert_eq!(cb.failure_count().await, 1);
        assert!(!cb.is_open().await);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = breaker(3, Duration::from_secs(60));

        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        assert_eq!(cb.failure_count().await, 0);

        // Need 3 more failures to open
        cb.record_failure().await;
        cb.record_failure().await;
        assert!(!cb.is_open().await);
    }

    #[tokio::test]
    async fn test_models_and_tenants_are_independent() {
        let store = Arc::new(MemoryCounterStore::new());
        let gpt = breaker_on(Arc::clone(&store), "gpt-4o", None, 2, Duration::from_secs(60));
        let claude = breaker_on(Arc::clone(&store), "claude-sonnet-4-5", None, 2, Duration::from_secs(60));
        let gpt_acme = breaker_on(Arc::clone(&store), "gpt-4o", Some("acme"), 2, Duration::from_secs(60));

        gpt.record_failure().await;
        gpt.record_failure().await;

        assert!(gpt.is_open().await);
        assert!(!claude.is_open().await);
        assert!(!gpt_acme.is_open().await);
    }

    #[tokio::test]
    async fn test_breakers_share_state_through_store() {
        let store = Arc::new(MemoryCounterStore::new());
        let first = breaker_on(Arc::clone(&store), "m1", None, 2, Duration::from_secs(60));
        let second = breaker_on(Arc::clone(&store), "m1", None, 2, Duration::from_secs(60));

        first.record_failure().await;
        assert!(second.record_failure().await);
        assert!(first.is_open().await);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let cb = breaker(2, Duration::from_secs(60));
        cb.record_failure().await;

        let status = cb.status().await;
        assert_eq!(status.model_id, "m1");
        assert_eq!(status.errors_threshold, 2);
        assert_eq!(status.failure_count, 1);
        assert!(!status.open);

        cb.record_failure().await;
        let status = cb.status().await;
        assert!(status.open);
        assert!(status.open_until.is_some());
    }

    #[tokio::test]
    async fn test_opening_emits_alert() {
        let alerts = Arc::new(MemoryAlertSink::new());
        let cb = CircuitBreaker::new(
            "SummaryAgent",
            "m1",
            CircuitBreakerConfig::new(1, Duration::from_secs(60), Duration::from_secs(30)),
            Some("acme"),
            Arc::new(MemoryCounterStore::new()),
            alerts.clone(),
        );

        cb.record_failure().await;

        let received = alerts.alerts();
        assert_eq!(received.len(), 1);
        assert!(matches!(
            &received[0],
            Alert::CircuitOpened { model, tenant_id: Some(t), failures: 1, .. }
                if model == "m1" && t == "acme"
        ));
    }

    #[tokio::test]
    async fn test_trip_by_another_executor_is_not_reopened() {
        let store = Arc::new(MemoryCounterStore::new());
        let alerts = Arc::new(MemoryAlertSink::new());
        let cb = CircuitBreaker::new(
            "SummaryAgent",
            "m1",
            CircuitBreakerConfig::new(2, Duration::from_secs(60), Duration::from_secs(30)),
            None,
            store.clone(),
            alerts.clone(),
        );

        cb.record_failure().await;
        assert!(cb.record_failure().await);
        let open_until = cb.open_until().await;

        // A concurrent failure counted before the reset landed
        store
            .write("steadfast:cb:SummaryAgent:m1:failures", 2, Some(Duration::from_secs(60)))
            .await
            .unwrap();

        assert!(!cb.record_failure().await);
        assert!(cb.is_open().await);
        assert_eq!(cb.open_until().await, open_until);
        assert_eq!(alerts.alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_store_outage_never_blocks() {
        let cb = CircuitBreaker::new(
            "SummaryAgent",
            "m1",
            CircuitBreakerConfig::new(1, Duration::from_secs(60), Duration::from_secs(30)),
            None,
            Arc::new(DownStore),
            Arc::new(TracingAlertSink),
        );

        assert!(!cb.record_failure().await);
        assert!(!cb.is_open().await);
        cb.record_success().await;
        assert_eq!(cb.failure_count().await, 0);
    }
}
