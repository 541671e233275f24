//! End-to-end execution tests.
//!
//! Drives the executor with scripted callbacks against an isolated memory
//! store and checks retries, fallback, circuit breaking, deadlines and
//! budgets as a caller sees them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use steadfast_core::{CircuitBreakerConfig, LlmError, ReliabilityConfig};
use steadfast_runtime::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const AGENT: &str = "SummaryAgent";

fn fast_config() -> ReliabilityConfig {
    ReliabilityConfig::default()
        .with_base_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5))
}

fn breaker_config(errors: u32, cooldown: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig::new(errors, Duration::from_secs(60), cooldown)
}

fn executor(config: ReliabilityConfig, store: &Arc<MemoryCounterStore>) -> Executor {
    Executor::new(config, "m1", AGENT, None)
        .unwrap()
        .with_store(store.clone())
}

/// Records which models the callback was invoked with.
#[derive(Default)]
struct CallLog {
    calls: Mutex<Vec<String>>,
}

impl CallLog {
    fn record(&self, model: &str) -> usize {
        let mut calls = self.calls.lock();
        calls.push(model.to_string());
        calls.iter().filter(|m| *m == model).count()
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retries_primary_until_it_succeeds() {
    let store = Arc::new(MemoryCounterStore::new());
    let log = CallLog::default();
    let config = fast_config().with_max_retries(2).with_fallback("m2");

    let result = executor(config, &store)
        .execute(|model| {
            let nth = log.record(&model);
            async move {
                if model == "m1" && nth < 3 {
                    Err(LlmError::RateLimited { retry_after: None })
                } else {
                    Ok(format!("{model} ok"))
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(result.value, "m1 ok");
    assert_eq!(result.models_tried, ["m1"]);
    assert_eq!(log.calls(), ["m1", "m1", "m1"]);
    assert_eq!(result.call_count(), 3);
}

#[tokio::test]
async fn exhausts_chain_on_persistent_transient_errors() {
    let store = Arc::new(MemoryCounterStore::new());
    let log = CallLog::default();
    let config = fast_config().with_max_retries(1).with_fallbacks(["m2", "m3"]);

    let err = executor(config, &store)
        .execute(|model| {
            log.record(&model);
            async { Err::<(), _>(LlmError::ServerError { status: 502 }) }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::AllModelsExhausted { .. }));
    assert_eq!(err.models_tried(), ["m1", "m2", "m3"]);
    assert_eq!(err.last_error(), Some(&LlmError::ServerError { status: 502 }));
    assert_eq!(log.calls(), ["m1", "m1", "m2", "m2", "m3", "m3"]);
    assert_eq!(err.attempts().len(), 6);
}

#[tokio::test]
async fn skips_model_with_open_circuit() {
    let store = Arc::new(MemoryCounterStore::new());
    let breakers = breaker_config(3, Duration::from_secs(60));

    let primary = CircuitBreaker::new(
        AGENT,
        "m1",
        breakers.clone(),
        None,
        store.clone(),
        Arc::new(TracingAlertSink),
    );
    for _ in 0..3 {
        primary.record_failure().await;
    }
    assert!(primary.is_open().await);

    let log = CallLog::default();
    let config = fast_config().with_fallback("m2").with_circuit_breaker(breakers);

    let result = executor(config, &store)
        .execute(|model| {
            log.record(&model);
            async move { Ok::<_, LlmError>(model) }
        })
        .await
        .unwrap();

    assert_eq!(result.value, "m2");
    assert_eq!(log.calls(), ["m2"]);
    assert!(result.attempts[0].is_short_circuit());
    assert_eq!(result.attempts[0].model, "m1");
    assert!(result.attempts[1].is_success());
}

#[tokio::test]
async fn permanent_errors_try_each_model_once() {
    let store = Arc::new(MemoryCounterStore::new());
    let log = CallLog::default();
    let config = fast_config().with_max_retries(5).with_fallbacks(["m2", "m3"]);

    let err = executor(config, &store)
        .execute(|model| {
            log.record(&model);
            async { Err::<(), _>(LlmError::Authentication) }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::AllModelsExhausted { .. }));
    assert_eq!(err.models_tried(), ["m1", "m2", "m3"]);
    assert_eq!(log.calls(), ["m1", "m2", "m3"]);
}

#[tokio::test]
async fn deadline_wins_over_exhaustion() {
    let store = Arc::new(MemoryCounterStore::new());
    let config = ReliabilityConfig::default()
        .with_max_retries(5)
        .with_base_delay(Duration::from_millis(40))
        .with_max_delay(Duration::from_secs(1))
        .with_fallbacks(["m2", "m3"])
        .with_total_timeout(Duration::from_millis(100));

    let started = Instant::now();
    let err = executor(config, &store)
        .execute(|_model| async { Err::<(), _>(LlmError::ConnectionReset) })
        .await
        .unwrap_err();

    match &err {
        ExecutionError::TotalTimeout { timeout, elapsed, .. } => {
            assert_eq!(*timeout, Duration::from_millis(100));
            assert!(*elapsed >= Duration::from_millis(100));
        }
        other => panic!("expected total timeout, got {other}"),
    }
    assert_eq!(err.models_tried(), ["m1"]);
    // Backoff is clipped to the deadline, never slept past it
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn slow_attempts_hit_deadline_mid_chain() {
    let store = Arc::new(MemoryCounterStore::new());
    let config = fast_config()
        .with_fallbacks(["m2", "m3"])
        .with_total_timeout(Duration::from_millis(50));

    let err = executor(config, &store)
        .execute(|_model| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Err::<(), _>(LlmError::Timeout(Duration::from_millis(30)))
        })
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    // m3 was never called before the deadline
    assert_eq!(err.models_tried(), ["m1", "m2"]);
    assert_eq!(err.attempts().len(), 2);
}

#[tokio::test]
async fn deadline_survives_oversized_backoff() {
    let store = Arc::new(MemoryCounterStore::new());
    let config = ReliabilityConfig::from_yaml(
        "retries:\n  max: 1\n  backoff: constant\n  base: 1.5e19\ntotal_timeout: 0.05\n",
    )
    .unwrap();

    // Jitter is random, so run enough times to hit the upper end
    for _ in 0..10 {
        let err = executor(config.clone(), &store)
            .execute(|_model| async { Err::<(), _>(LlmError::ConnectionReset) })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.attempts().len(), 1);
    }
}

#[tokio::test]
async fn breaker_closes_after_cooldown() {
    let store = Arc::new(MemoryCounterStore::new());
    let config = fast_config().with_circuit_breaker(breaker_config(3, Duration::from_millis(100)));
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let _ = executor(config.clone(), &store)
            .execute(|_model| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(LlmError::ServerError { status: 500 }) }
            })
            .await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let err = executor(config.clone(), &store)
        .execute(|_model| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, LlmError>(()) }
        })
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let result = executor(config, &store)
        .execute(|_model| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, LlmError>("recovered") }
        })
        .await
        .unwrap();
    assert_eq!(result.value, "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn success_resets_shared_failure_count() {
    let store = Arc::new(MemoryCounterStore::new());
    let config = fast_config().with_circuit_breaker(breaker_config(3, Duration::from_secs(60)));

    for _ in 0..2 {
        let _ = executor(config.clone(), &store)
            .execute(|_model| async { Err::<(), _>(LlmError::ConnectionReset) })
            .await;
    }

    executor(config.clone(), &store)
        .execute(|_model| async { Ok::<_, LlmError>(()) })
        .await
        .unwrap();

    let _ = executor(config.clone(), &store)
        .execute(|_model| async { Err::<(), _>(LlmError::ConnectionReset) })
        .await;

    let probe = CircuitBreaker::new(
        AGENT,
        "m1",
        breaker_config(3, Duration::from_secs(60)),
        None,
        store.clone(),
        Arc::new(TracingAlertSink),
    );
    assert!(!probe.is_open().await);
    assert_eq!(probe.failure_count().await, 1);
}

#[tokio::test]
async fn fatal_error_leaves_breaker_uncharged() {
    let store = Arc::new(MemoryCounterStore::new());
    let config = fast_config()
        .with_fallback("m2")
        .with_circuit_breaker(breaker_config(1, Duration::from_secs(60)));

    let err = executor(config, &store)
        .execute(|_model| async { Err::<(), _>(LlmError::InvalidArgument("temperature".into())) })
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::Aborted { .. }));
    assert_eq!(err.models_tried(), ["m1"]);

    let breaker = CircuitBreaker::new(
        AGENT,
        "m1",
        breaker_config(1, Duration::from_secs(60)),
        None,
        store.clone(),
        Arc::new(TracingAlertSink),
    );
    assert!(!breaker.is_open().await);
    assert_eq!(breaker.failure_count().await, 0);
}

#[tokio::test]
async fn circuit_alert_reaches_sink() {
    let store = Arc::new(MemoryCounterStore::new());
    let alerts = Arc::new(MemoryAlertSink::new());
    let config = fast_config()
        .with_max_retries(3)
        .with_circuit_breaker(breaker_config(2, Duration::from_secs(60)));

    let err = Executor::new(config, "m1", AGENT, Some("acme"))
        .unwrap()
        .with_store(store)
        .with_alerts(alerts.clone())
        .execute(|_model| async { Err::<(), _>(LlmError::ConnectionReset) })
        .await
        .unwrap_err();

    assert_eq!(err.attempts().len(), 2);
    let received = alerts.alerts();
    assert_eq!(received.len(), 1);
    match &received[0] {
        Alert::CircuitOpened {
            model, tenant_id, ..
        } => {
            assert_eq!(model, "m1");
            assert_eq!(tenant_id.as_deref(), Some("acme"));
        }
        other => panic!("unexpected alert {other:?}"),
    }
}

#[tokio::test]
async fn hard_budget_refuses_before_any_call() {
    let store = Arc::new(MemoryCounterStore::new());
    let budget = Arc::new(CounterBudget::new(
        BudgetConfig {
            limits: BudgetLimits {
                per_agent_daily: Some(1.0),
                ..Default::default()
            },
            enforcement: Enforcement::Hard,
        },
        store.clone(),
        Arc::new(TracingAlertSink),
    ));
    let scope = BudgetScope::new(AGENT, None);
    budget.record(&scope, Spend::usd(1.25, 4000)).await;

    let calls = AtomicUsize::new(0);
    let err = executor(fast_config(), &store)
        .with_budget(budget)
        .execute(|_model| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, LlmError>(()) }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::BudgetExceeded { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(err.attempts().is_empty());
    assert!(err.models_tried().is_empty());
}

#[tokio::test]
async fn concurrent_executors_share_breaker_state() {
    let store = Arc::new(MemoryCounterStore::new());
    let config = fast_config().with_circuit_breaker(breaker_config(1000, Duration::from_secs(60)));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let exec = executor(config.clone(), &store);
        handles.push(tokio::spawn(async move {
            exec.execute(|_model| async { Err::<(), _>(LlmError::ConnectionReset) })
                .await
                .is_err()
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    let probe = CircuitBreaker::new(
        AGENT,
        "m1",
        breaker_config(1000, Duration::from_secs(60)),
        None,
        store,
        Arc::new(TracingAlertSink),
    );
    assert_eq!(probe.failure_count().await, 16);
}

#[test]
fn blocking_execution_falls_back() {
    let store = Arc::new(MemoryCounterStore::new());
    let mut seen = Vec::new();

    let result = executor(fast_config().with_max_retries(1).with_fallback("m2"), &store)
        .execute_blocking(|model| {
            seen.push(model.clone());
            if model == "m1" {
                Err(LlmError::Timeout(Duration::from_millis(10)))
            } else {
                Ok(7)
            }
        })
        .unwrap();

    assert_eq!(result.value, 7);
    assert_eq!(seen, ["m1", "m1", "m2"]);
}

#[tokio::test]
async fn empty_response_moves_to_next_model() {
    let store = Arc::new(MemoryCounterStore::new());
    let log = CallLog::default();

    let result = executor(fast_config().with_max_retries(2).with_fallback("m2"), &store)
        .execute_optional(|model| {
            log.record(&model);
            async move {
                if model == "m1" {
                    Ok::<Option<&str>, LlmError>(None)
                } else {
                    Ok(Some("text"))
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(result.value, "text");
    assert_eq!(log.calls(), ["m1", "m2"]);
}
