//! Operational alerts raised by breakers and budgets.
//!
//! Alert delivery is a side channel: a failing sink is logged and never
//! changes the outcome of the call that raised the alert.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors from an alert sink.
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Alert delivery failed: {0}")]
    Delivery(String),
}

/// An event worth telling an operator about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Alert {
    /// A model's circuit opened after repeated failures.
    CircuitOpened {
        agent_type: String,
        model: String,
        tenant_id: Option<String>,
        failures: i64,
        cooldown: Duration,
    },

    /// Spend crossed a soft limit; the call was allowed.
    BudgetSoftCap {
        scope: String,
        tenant_id: Option<String>,
        limit: i64,
        current: i64,
    },

    /// Spend crossed a hard limit; the call was refused.
    BudgetHardCap {
        scope: String,
        tenant_id: Option<String>,
        limit: i64,
        current: i64,
    },
}

impl Alert {
    /// Short event name.
    pub fn event(&self) -> &'static str {
        match self {
            Alert::CircuitOpened { .. } => "circuit_opened",
            Alert::BudgetSoftCap { .. } => "budget_soft_cap",
            Alert::BudgetHardCap { .. } => "budget_hard_cap",
        }
    }
}

/// Destination for alerts (pager, chat webhook, log).
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert.
    async fn emit(&self, alert: Alert) -> Result<(), AlertError>;
}

/// Emit an alert, logging instead of propagating any delivery failure.
pub async fn emit_quietly(sink: &dyn AlertSink, alert: Alert) {
    let event = alert.event();
    if let Err(e) = sink.emit(alert).await {
        tracing::warn!(event, error = %e, "Failed to deliver alert");
    }
}

/// Writes alerts to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn emit(&self, alert: Alert) -> Result<(), AlertError> {
        let payload = serde_json::to_string(&alert).map_err(|e| AlertError::Delivery(e.to_string()))?;
        tracing::warn!(event = alert.event(), alert = %payload, "Reliability alert");
        Ok(())
    }
}

/// Keeps alerts in memory, for embedders that poll and for tests.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts received so far.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    /// Remove and return the alerts received so far.
    pub fn drain(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.alerts.lock())
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn emit(&self, alert: Alert) -> Result<(), AlertError> {
        self.alerts.lock().push(alert);
        Ok(())
    }
}
