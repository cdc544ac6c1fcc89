//! Retry with exponential backoff plus a per-key circuit breaker.
//!
//! Breaker state lives in a map keyed by operation key, created lazily on the
//! first failure and removed on success. Every state transition happens in a
//! single lock scope; the lock is never held across an `.await`.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{CircuitBreakerConfig, ResilienceConfig, RetryPolicy};
use crate::error::{OperationError, ResilienceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through, failures are counted
    Closed,
    /// Calls are rejected without running the operation
    Open,
    /// Recovery timeout elapsed, the next call decides
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub failure_count: u32,
    pub last_failure_at: Option<Instant>,
    pub state: CircuitState,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            failure_count: 0,
            last_failure_at: None,
            state: CircuitState::Closed,
        }
    }
}

/// Point-in-time view of one tracked breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_last_failure_ms: Option<u64>,
}

fn snapshot(
    circuits: &HashMap<String, CircuitBreakerState>,
    now: Instant,
) -> BTreeMap<String, CircuitStatus> {
    circuits
        .iter()
        .map(|(key, circuit)| {
            let since_last_failure_ms = circuit.last_failure_at.map(|at| {
                u64::try_from(now.saturating_duration_since(at).as_millis()).unwrap_or(u64::MAX)
            });
            (
                key.clone(),
                CircuitStatus {
                    state: circuit.state,
                    failure_count: circuit.failure_count,
                    since_last_failure_ms,
                },
            )
        })
        .collect()
}

/// Admission check. An open circuit whose recovery timeout has elapsed moves
/// to half-open with its failure count reset; otherwise it rejects with the
/// remaining wait.
fn admit(
    circuits: &mut HashMap<String, CircuitBreakerState>,
    key: &str,
    config: &CircuitBreakerConfig,
    now: Instant,
) -> Result<(), Duration> {
    let Some(circuit) = circuits.get_mut(key) else {
        return Ok(());
    };
    if circuit.state != CircuitState::Open {
        return Ok(());
    }

    let elapsed = circuit
        .last_failure_at
        .map_or(config.recovery_timeout, |at| now.saturating_duration_since(at));
    if elapsed >= config.recovery_timeout {
        circuit.state = CircuitState::HalfOpen;
        circuit.failure_count = 0;
        info!(key, "circuit breaker half-open, allowing trial call");
        Ok(())
    } else {
        Err(config.recovery_timeout - elapsed)
    }
}

fn record_success(circuits: &mut HashMap<String, CircuitBreakerState>, key: &str) {
    if let Some(previous) = circuits.remove(key) {
        if previous.state != CircuitState::Closed {
            info!(key, "circuit breaker closed, operation recovered");
        }
    }
}

fn record_failure(
    circuits: &mut HashMap<String, CircuitBreakerState>,
    key: &str,
    config: &CircuitBreakerConfig,
    now: Instant,
) -> CircuitState {
    let circuit = circuits
        .entry(key.to_string())
        .or_insert_with(CircuitBreakerState::new);
    circuit.failure_count = circuit.failure_count.saturating_add(1);
    circuit.last_failure_at = Some(now);

    let reopen = circuit.state == CircuitState::HalfOpen;
    if reopen || circuit.failure_count >= config.failure_threshold {
        if circuit.state != CircuitState::Open {
            warn!(
                key,
                failures = circuit.failure_count,
                threshold = config.failure_threshold,
                recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
                reopened = reopen,
                "circuit breaker opened"
            );
        }
        circuit.state = CircuitState::Open;
    }
    circuit.state
}

/// Runs remote operations with retry and circuit breaking. Construct one per
/// process (or per test) and share it behind an `Arc`.
#[derive(Debug)]
pub struct ResilientOperationExecutor {
    policy: RetryPolicy,
    circuit: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, CircuitBreakerState>>,
}

impl Default for ResilientOperationExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), CircuitBreakerConfig::default())
    }
}

impl ResilientOperationExecutor {
    pub fn new(policy: RetryPolicy, circuit: CircuitBreakerConfig) -> Self {
        Self {
            policy,
            circuit,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(config.retry.clone(), config.circuit.clone())
    }

    pub async fn execute<T, F, Fut>(&self, key: &str, operation: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        self.execute_with(key, &self.policy, operation).await
    }

    /// Run `operation` under `policy`, invoking it at most
    /// `1 + policy.max_retries` times.
    pub async fn execute_with<T, F, Fut>(
        &self,
        key: &str,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        {
            let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(retry_after) = admit(&mut circuits, key, &self.circuit, Instant::now()) {
                return Err(ResilienceError::CircuitOpen {
                    key: key.to_string(),
                    retry_after,
                });
            }
        }

        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
                    record_success(&mut circuits, key);
                    return Ok(value);
                }
                Err(err) => {
                    let retryable = policy.should_retry.should_retry(&err);
                    if retryable && attempt < policy.max_retries {
                        let delay = policy.backoff_delay(attempt);
                        attempt += 1;
                        warn!(
                            key,
                            attempt,
                            max_retries = policy.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "operation failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    {
                        let mut circuits =
                            self.circuits.lock().unwrap_or_else(|e| e.into_inner());
                        record_failure(&mut circuits, key, &self.circuit, Instant::now());
                    }
                    warn!(
                        key,
                        attempts = attempt + 1,
                        retryable,
                        error = %err,
                        "operation failed"
                    );
                    return Err(ResilienceError::Failed {
                        key: key.to_string(),
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            }
        }
    }

    /// Current breaker state for `key`; keys without recorded failures are closed.
    pub fn circuit_state(&self, key: &str) -> CircuitState {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits
            .get(key)
            .map_or(CircuitState::Closed, |circuit| circuit.state)
    }

    pub fn failure_count(&self, key: &str) -> u32 {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits.get(key).map_or(0, |circuit| circuit.failure_count)
    }

    /// Every key with a tracked breaker. Keys that never failed, or whose last
    /// call succeeded, are absent.
    pub fn circuit_statuses(&self) -> BTreeMap<String, CircuitStatus> {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        snapshot(&circuits, Instant::now())
    }

    /// Force `key` back to closed.
    pub fn reset(&self, key: &str) {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        if circuits.remove(key).is_some() {
            info!(key, "circuit breaker manually reset");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    fn breaker(failure_threshold: u32, recovery_timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout,
        }
    }

    async fn failing_call(
        executor: &ResilientOperationExecutor,
        key: &str,
        calls: &Arc<AtomicUsize>,
        status: u16,
    ) -> Result<(), ResilienceError> {
        executor
            .execute(key, || {
                let calls = Arc::clone(calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(OperationError::status(status, "failure"))
                }
            })
            .await
    }

    #[tokio::test]
    async fn server_error_retries_max_retries_times() {
        let executor = ResilientOperationExecutor::new(
            fast_policy(3),
            breaker(50, Duration::from_secs(30)),
        );
        let calls = Arc::new(AtomicUsize::new(0));

        let err = failing_call(&executor, "sync:{}", &calls, 503)
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match err {
            ResilienceError::Failed {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 4);
                assert_eq!(source, OperationError::status(503, "failure"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let executor = ResilientOperationExecutor::new(
            fast_policy(3),
            breaker(50, Duration::from_secs(30)),
        );
        let calls = Arc::new(AtomicUsize::new(0));

        let err = failing_call(&executor, "sync:{}", &calls, 404)
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ResilienceError::Failed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn success_after_transient_failures() {
        let executor = ResilientOperationExecutor::new(
            fast_policy(3),
            breaker(5, Duration::from_secs(30)),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let value = executor
            .execute("load:{}", move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(OperationError::Network("connection refused".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(executor.circuit_state("load:{}"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn custom_predicate_overrides_default_classification() {
        let executor = ResilientOperationExecutor::default();
        let policy = fast_policy(2).with_should_retry(|_| false);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = executor
            .execute_with("x:{}", &policy, move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(OperationError::Timeout(Duration::from_millis(1)))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_and_recovers() {
        let executor = ResilientOperationExecutor::new(
            fast_policy(0),
            breaker(3, Duration::from_millis(50)),
        );
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let _ = failing_call(&executor, "update:{}", &calls, 500).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(executor.circuit_state("update:{}"), CircuitState::Open);

        let rejected = failing_call(&executor, "update:{}", &calls, 500)
            .await
            .unwrap_err();
        assert!(matches!(rejected, ResilienceError::CircuitOpen { .. }));
        assert!(
            rejected
                .to_string()
                .contains("circuit breaker open for operation update:{}")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // other keys are unaffected
        let other_calls = Arc::new(AtomicUsize::new(0));
        let _ = failing_call(&executor, "update:{\"id\":2}", &other_calls, 500).await;
        assert_eq!(other_calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let value = executor
            .execute("update:{}", || async { Ok::<_, OperationError>("ok") })
            .await
            .unwrap();
        assert_eq!(value, "ok");
        assert_eq!(executor.circuit_state("update:{}"), CircuitState::Closed);
        assert_eq!(executor.failure_count("update:{}"), 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let executor = ResilientOperationExecutor::new(
            fast_policy(0),
            breaker(3, Duration::from_millis(30)),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let _ = failing_call(&executor, "k", &calls, 500).await;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        let _ = failing_call(&executor, "k", &calls, 500).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(executor.circuit_state("k"), CircuitState::Open);
        assert_eq!(executor.failure_count("k"), 1);

        let rejected = failing_call(&executor, "k", &calls, 500).await.unwrap_err();
        assert!(matches!(rejected, ResilienceError::CircuitOpen { .. }));
    }

    #[test]
    fn admit_moves_open_circuit_to_half_open_after_timeout() {
        let config = breaker(2, Duration::from_secs(30));
        let start = Instant::now();
        let mut circuits = HashMap::new();

        record_failure(&mut circuits, "k", &config, start);
        assert_eq!(
            record_failure(&mut circuits, "k", &config, start),
            CircuitState::Open
        );

        let early = admit(&mut circuits, "k", &config, start + Duration::from_secs(10));
        assert_eq!(early, Err(Duration::from_secs(20)));

        assert!(admit(&mut circuits, "k", &config, start + Duration::from_secs(30)).is_ok());
        assert_eq!(circuits["k"].state, CircuitState::HalfOpen);
        assert_eq!(circuits["k"].failure_count, 0);

        record_success(&mut circuits, "k");
        assert!(!circuits.contains_key("k"));
    }

    #[test]
    fn manual_reset_closes_circuit() {
        let executor =
            ResilientOperationExecutor::new(fast_policy(0), breaker(1, Duration::from_secs(60)));
        {
            let mut circuits = executor.circuits.lock().unwrap();
            record_failure(&mut circuits, "k", &executor.circuit, Instant::now());
        }
        assert_eq!(executor.circuit_state("k"), CircuitState::Open);
        executor.reset("k");
        assert_eq!(executor.circuit_state("k"), CircuitState::Closed);
    }

    #[test]
    fn snapshot_lists_every_tracked_key() {
        let config = breaker(2, Duration::from_secs(30));
        let start = Instant::now();
        let mut circuits = HashMap::new();
        record_failure(&mut circuits, "fetch:{\"id\":1}", &config, start);
        record_failure(&mut circuits, "save:{}", &config, start);
        record_failure(&mut circuits, "save:{}", &config, start);
        record_failure(&mut circuits, "healed:{}", &config, start);
        record_success(&mut circuits, "healed:{}");

        let statuses = snapshot(&circuits, start + Duration::from_millis(250));
        let keys: Vec<&str> = statuses.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["fetch:{\"id\":1}", "save:{}"]);
        assert_eq!(
            statuses["save:{}"],
            CircuitStatus {
                state: CircuitState::Open,
                failure_count: 2,
                since_last_failure_ms: Some(250),
            }
        );
        assert_eq!(statuses["fetch:{\"id\":1}"].state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn circuit_statuses_reflect_failed_calls() {
        let executor =
            ResilientOperationExecutor::new(fast_policy(0), breaker(1, Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));
        assert!(executor.circuit_statuses().is_empty());

        let _ = failing_call(&executor, "sync:{}", &calls, 503).await;
        let statuses = executor.circuit_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses["sync:{}"].state, CircuitState::Open);
        assert_eq!(
            serde_json::to_value(&statuses["sync:{}"]).unwrap()["state"],
            "open"
        );
    }
}
