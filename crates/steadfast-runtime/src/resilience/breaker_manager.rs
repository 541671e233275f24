//! Per-execution cache of circuit breakers, one per model.

use std::collections::HashMap;
use std::sync::Arc;

use steadfast_core::CircuitBreakerConfig;

use super::circuit_breaker::{BreakerStatus, CircuitBreaker};
use crate::alerts::AlertSink;
use crate::store::CounterStore;

/// Routes breaker queries for one execution to the right model's breaker.
///
/// Without a circuit breaker config every query is a no-op: nothing is
/// ever open and failures never trip anything.
pub struct BreakerManager {
    agent_type: String,
    tenant_id: Option<String>,
    config: Option<CircuitBreakerConfig>,
    store: Arc<dyn CounterStore>,
    alerts: Arc<dyn AlertSink>,
    breakers: HashMap<String, CircuitBreaker>,
}

impl BreakerManager {
    /// Create a manager for one agent type and tenant.
    pub fn new(
        agent_type: impl Into<String>,
        tenant_id: Option<String>,
        config: Option<CircuitBreakerConfig>,
        store: Arc<dyn CounterStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            tenant_id,
            config,
            store,
            alerts,
            breakers: HashMap::new(),
        }
    }

    /// Whether circuit breaking is configured.
    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// The breaker for `model_id`, created on first use.
    pub fn for_model(&mut self, model_id: &str) -> Option<&CircuitBreaker> {
        let config = self.config.as_ref()?;

        if !self.breakers.contains_key(model_id) {
            let breaker = CircuitBreaker::new(
                self.agent_type.as_str(),
                model_id,
                config.clone(),
                self.tenant_id.as_deref(),
                Arc::clone(&self.store),
                Arc::clone(&self.alerts),
            );
            self.breakers.insert(model_id.to_string(), breaker);
        }

        self.breakers.get(model_id)
    }

    /// Check if `model_id` is currently blocked. Always false when disabled.
    pub async fn is_open(&mut self, model_id: &str) -> bool {
        match self.for_model(model_id) {
            Some(breaker) => breaker.is_open().await,
            None => false,
        }
    }

    /// Record a successful call to `model_id`.
    pub async fn record_success(&mut self, model_id: &str) {
        if let Some(breaker) = self.for_model(model_id) {
            breaker.record_success().await;
        }
    }

    /// Record a failed call to `model_id`. Returns true if the circuit opened.
    pub async fn record_failure(&mut self, model_id: &str) -> bool {
        match self.for_model(model_id) {
            Some(breaker) => breaker.record_failure().await,
            None => false,
        }
    }

    /// Status of every breaker created so far, sorted by model.
    pub async fn statuses(&self) -> Vec<BreakerStatus> {
        let mut models: Vec<&String> = self.breakers.keys().collect();
        models.sort();

        let mut statuses = Vec::with_capacity(models.len());
        for model in models {
            statuses.push(self.breakers[model].status().await);
        }
        statuses
    }
}
