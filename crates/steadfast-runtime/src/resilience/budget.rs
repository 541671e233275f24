//! Spend governance for LLM calls.
//!
//! Enforces global and per-agent cost limits plus token limits, per day and
//! per month, on top of the shared counter store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::alerts::{emit_quietly, Alert, AlertSink};
use crate::store::CounterStore;

const KEY_PREFIX: &str = "steadfast:budget";

/// Counters outlive their period a little so late reads still see them.
const DAILY_TTL: Duration = Duration::from_secs(2 * 24 * 60 * 60);
const MONTHLY_TTL: Duration = Duration::from_secs(32 * 24 * 60 * 60);

const MICROS_PER_USD: f64 = 1_000_000.0;

/// A hard budget limit refused the call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Budget exceeded for {scope}: {current} of {limit}")]
pub struct BudgetExceeded {
    /// Which limit, e.g. `agent:SummaryAgent:daily_cost`
    pub scope: String,

    /// Limit in the scope's unit (micro-USD for cost, tokens for tokens)
    pub limit: i64,

    /// Spend recorded so far in the same unit
    pub current: i64,
}

/// What happens when a limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    /// Track spend only
    #[default]
    None,

    /// Log and alert, but allow the call
    Soft,

    /// Refuse the call
    Hard,
}

/// Spend limits. Costs are in USD; absent limits are not enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BudgetLimits {
    pub global_daily: Option<f64>,
    pub global_monthly: Option<f64>,
    pub per_agent_daily: Option<f64>,
    pub per_agent_monthly: Option<f64>,
    pub daily_tokens: Option<i64>,
    pub monthly_tokens: Option<i64>,
}

/// Budget policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BudgetConfig {
    pub limits: BudgetLimits,
    pub enforcement: Enforcement,
}

/// Who is spending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetScope {
    pub agent_type: String,
    pub tenant_id: Option<String>,
}

impl BudgetScope {
    /// Create a scope.
    pub fn new(agent_type: impl Into<String>, tenant_id: Option<&str>) -> Self {
        Self {
            agent_type: agent_type.into(),
            tenant_id: tenant_id.map(str::to_string),
        }
    }
}

/// Cost and tokens of one completed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Spend {
    /// Cost in millionths of a USD
    pub cost_micros: i64,

    /// Total tokens
    pub tokens: i64,
}

impl Spend {
    /// Spend from a USD cost and a token count.
    pub fn usd(cost: f64, tokens: i64) -> Self {
        Self {
            cost_micros: usd_to_micros(cost),
            tokens,
        }
    }
}

/// Spend recorded in the current periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BudgetUsage {
    pub global_daily_micros: i64,
    pub global_monthly_micros: i64,
    pub agent_daily_micros: i64,
    pub agent_monthly_micros: i64,
    pub daily_tokens: i64,
    pub monthly_tokens: i64,
}

/// Budget check and accounting consumed by the executor.
#[async_trait]
pub trait BudgetGuard: Send + Sync {
    /// Refuse the next call if a hard limit has been reached.
    async fn check(&self, scope: &BudgetScope) -> Result<(), BudgetExceeded>;

    /// Account for a completed call.
    async fn record(&self, scope: &BudgetScope, spend: Spend);
}

fn usd_to_micros(usd: f64) -> i64 {
    (usd * MICROS_PER_USD).round() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Period {
    Daily,
    Monthly,
}

impl Period {
    fn tag(self, now: DateTime<Utc>) -> String {
        match self {
            Period::Daily => now.format("%Y-%m-%d").to_string(),
            Period::Monthly => now.format("%Y-%m").to_string(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Monthly => "monthly",
        }
    }

    fn ttl(self) -> Duration {
        match self {
            Period::Daily => DAILY_TTL,
            Period::Monthly => MONTHLY_TTL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Metric {
    Cost,
    Tokens,
}

impl Metric {
    fn name(self) -> &'static str {
        match self {
            Metric::Cost => "cost",
            Metric::Tokens => "tokens",
        }
    }
}

/// One enforced counter: who, which period, which metric.
struct Counter<'a> {
    agent: Option<&'a str>,
    period: Period,
    metric: Metric,
}

impl Counter<'_> {
    fn scope_name(&self) -> String {
        let owner = match self.agent {
            Some(agent) => format!("agent:{agent}"),
            None => "global".to_string(),
        };
        format!("{owner}:{}_{}", self.period.name(), self.metric.name())
    }

    fn key(&self, tenant: Option<&str>, now: DateTime<Utc>) -> String {
        let tenant = tenant.map(|t| format!(":{t}")).unwrap_or_default();
        format!(
            "{KEY_PREFIX}{tenant}:{}:{}",
            self.scope_name(),
            self.period.tag(now)
        )
    }
}

/// [`BudgetGuard`] that keeps spend in a [`CounterStore`].
pub struct CounterBudget {
    config: BudgetConfig,
    store: Arc<dyn CounterStore>,
    alerts: Arc<dyn AlertSink>,
}

impl CounterBudget {
    /// Create a budget over a shared store.
    pub fn new(
        config: BudgetConfig,
        store: Arc<dyn CounterStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            config,
            store,
            alerts,
        }
    }

    /// Budget policy.
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    fn counters<'a>(&self, scope: &'a BudgetScope) -> [(Counter<'a>, Option<i64>); 6] {
        let limits = &self.config.limits;
        let agent = Some(scope.agent_type.as_str());
        [
            (
                Counter { agent: None, period: Period::Daily, metric: Metric::Cost },
                limits.global_daily.map(usd_to_micros),
            ),
            (
                Counter { agent: None, period: Period::Monthly, metric: Metric::Cost },
                limits.global_monthly.map(usd_to_micros),
            ),
            (
                Counter { agent, period: Period::Daily, metric: Metric::Cost },
                limits.per_agent_daily.map(usd_to_micros),
            ),
            (
                Counter { agent, period: Period::Monthly, metric: Metric::Cost },
                limits.per_agent_monthly.map(usd_to_micros),
            ),
            (
                Counter { agent: None, period: Period::Daily, metric: Metric::Tokens },
                limits.daily_tokens,
            ),
            (
                Counter { agent: None, period: Period::Monthly, metric: Metric::Tokens },
                limits.monthly_tokens,
            ),
        ]
    }

    async fn current(&self, key: &str) -> i64 {
        match self.store.read(key).await {
            Ok(value) => value.unwrap_or(0),
            Err(e) => {
                tracing::warn!(key, error = %e, "Budget counter unavailable, assuming zero spend");
                0
            }
        }
    }

    /// Spend recorded in the current day and month.
    pub async fn usage(&self, scope: &BudgetScope) -> BudgetUsage {
        let now = Utc::now();
        let tenant = scope.tenant_id.as_deref();
        let [global_daily, global_monthly, agent_daily, agent_monthly, daily_tokens, monthly_tokens] =
            self.counters(scope);

        BudgetUsage {
            global_daily_micros: self.current(&global_daily.0.key(tenant, now)).await,
            global_monthly_micros: self.current(&global_monthly.0.key(tenant, now)).await,
            agent_daily_micros: self.current(&agent_daily.0.key(tenant, now)).await,
            agent_monthly_micros: self.current(&agent_monthly.0.key(tenant, now)).await,
            daily_tokens: self.current(&daily_tokens.0.key(tenant, now)).await,
            monthly_tokens: self.current(&monthly_tokens.0.key(tenant, now)).await,
        }
    }
}

#[async_trait]
impl BudgetGuard for CounterBudget {
    async fn check(&self, scope: &BudgetScope) -> Result<(), BudgetExceeded> {
        if self.config.enforcement == Enforcement::None {
            return Ok(());
        }

        let now = Utc::now();
        let tenant = scope.tenant_id.as_deref();

        for (counter, limit) in self.counters(scope) {
            let Some(limit) = limit else { continue };
            let current = self.current(&counter.key(tenant, now)).await;
            if current < limit {
                continue;
            }

            let exceeded = BudgetExceeded {
                scope: counter.scope_name(),
                limit,
                current,
            };

            if self.config.enforcement == Enforcement::Soft {
                tracing::warn!(scope = %exceeded.scope, limit, current, "Budget soft cap reached");
                emit_quietly(
                    self.alerts.as_ref(),
                    Alert::BudgetSoftCap {
                        scope: exceeded.scope,
                        tenant_id: scope.tenant_id.clone(),
                        limit,
                        current,
                    },
                )
                .await;
                continue;
            }

            tracing::warn!(scope = %exceeded.scope, limit, current, "Budget hard cap reached, refusing call");
            emit_quietly(
                self.alerts.as_ref(),
                Alert::BudgetHardCap {
                    scope: exceeded.scope.clone(),
                    tenant_id: scope.tenant_id.clone(),
                    limit,
                    current,
                },
            )
            .await;
            return Err(exceeded);
        }

        Ok(())
    }

    async fn record(&self, scope: &BudgetScope, spend: Spend) {
        let now = Utc::now();
        let tenant = scope.tenant_id.as_deref();

        for (counter, _) in self.counters(scope) {
            let amount = match counter.metric {
                Metric::Cost => spend.cost_micros,
                Metric::Tokens => spend.tokens,
            };
            if amount == 0 {
                continue;
            }

            let key = counter.key(tenant, now);
            if let Err(e) = self
                .store
                .increment(&key, amount, Some(counter.period.ttl()))
                .await
            {
                tracing::warn!(key = %key, error = %e, "Failed to record budget spend");
            }
        }
    }
}
