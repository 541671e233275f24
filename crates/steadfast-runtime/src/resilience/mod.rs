//! Resilience patterns backed by the shared counter store.
//!
//! This module provides:
//! - Circuit breakers that stop calls to a failing model
//! - Per-execution breaker routing
//! - Spend budgets with soft and hard caps

mod breaker_manager;
mod budget;
mod circuit_breaker;

pub use breaker_manager::BreakerManager;
pub use budget::{
    BudgetConfig, BudgetExceeded, BudgetGuard, BudgetLimits, BudgetScope, BudgetUsage,
    CounterBudget, Enforcement, Spend,
};
pub use circuit_breaker::{BreakerStatus, CircuitBreaker};
