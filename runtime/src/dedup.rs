//! Keyed coalescing of remote refreshes.
//!
//! Callers with the same operation key share one execution. Operations of the
//! same type but different keys run one at a time. A key that settled less
//! than its cooldown ago is not re-run. Pending work can be cancelled and
//! observers can follow the pending set through [`RefreshStats`] updates.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::config::{RefreshDefaults, ResilienceConfig};
use crate::error::{OperationError, ResilienceError};
use crate::executor::ResilientOperationExecutor;
use crate::perf::PerformanceRecorder;

type SharedRefresh<T> = Shared<BoxFuture<'static, Result<T, ResilienceError>>>;

/// What to run and how it is bucketed.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDescriptor {
    pub operation_type: String,
    pub params: Value,
    /// Unset or zero means the deduplicator's default cooldown
    pub cooldown: Option<Duration>,
    pub timeout: Option<Duration>,
}

impl OperationDescriptor {
    pub fn new(operation_type: impl Into<String>, params: Value) -> Self {
        Self {
            operation_type: operation_type.into(),
            params,
            cooldown: None,
            timeout: None,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn key(&self) -> String {
        operation_key(&self.operation_type, &self.params)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome<T> {
    Completed(T),
    /// Suppressed: the same key settled within its cooldown.
    CoolingDown { retry_in: Duration },
}

impl<T> RefreshOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            RefreshOutcome::Completed(value) => Some(value),
            RefreshOutcome::CoolingDown { .. } => None,
        }
    }
}

/// `type:params` with object keys sorted at every depth.
pub fn operation_key(operation_type: &str, params: &Value) -> String {
    format!("{operation_type}:{}", canonicalize_json(params))
}

fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map
                .iter()
                .map(|(key, entry)| (key, canonicalize_json(entry)))
                .collect();
            let mut out = Map::new();
            for (key, entry) in sorted {
                out.insert(key.clone(), entry);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        _ => value.clone(),
    }
}

/// Snapshot of the deduplicator, also published to subscribers on change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshStats {
    pub pending_count: usize,
    pub pending_keys: Vec<String>,
    /// When the most recent successful refresh settled
    pub last_refresh: Option<DateTime<Utc>>,
    /// Failed refreshes since the last success
    pub error_count: usize,
}

struct InFlight<T: Clone> {
    operation_type: String,
    run_id: String,
    abort: AbortHandle,
    future: SharedRefresh<T>,
}

struct DedupState<T: Clone> {
    in_flight: HashMap<String, InFlight<T>>,
    last_executed_at: HashMap<String, Instant>,
    longest_cooldown: Duration,
    last_refresh: Option<DateTime<Utc>>,
    error_count: usize,
    updates: watch::Sender<RefreshStats>,
}

enum Admission<T: Clone> {
    Join(SharedRefresh<T>),
    WaitForType(SharedRefresh<T>),
    CoolingDown(Duration),
    Run,
}

impl<T: Clone> DedupState<T> {
    fn new() -> Self {
        let (updates, _) = watch::channel(RefreshStats::default());
        Self {
            in_flight: HashMap::new(),
            last_executed_at: HashMap::new(),
            longest_cooldown: Duration::ZERO,
            last_refresh: None,
            error_count: 0,
            updates,
        }
    }

    fn admit(
        &mut self,
        key: &str,
        operation_type: &str,
        cooldown: Duration,
        now: Instant,
    ) -> Admission<T> {
        self.longest_cooldown = self.longest_cooldown.max(cooldown);
        if let Some(running) = self.in_flight.get(key) {
            return Admission::Join(running.future.clone());
        }
        if let Some(running) = self
            .in_flight
            .values()
            .find(|running| running.operation_type == operation_type)
        {
            return Admission::WaitForType(running.future.clone());
        }
        if let Some(last) = self.last_executed_at.get(key) {
            let since = now.saturating_duration_since(*last);
            if since < cooldown {
                return Admission::CoolingDown(cooldown - since);
            }
        }
        Admission::Run
    }

    /// Record the end of run `run_id`. A run that was cancelled and replaced
    /// leaves the replacement's in-flight entry alone.
    fn settle(&mut self, key: &str, run_id: &str, success: bool, now: Instant) {
        if self
            .in_flight
            .get(key)
            .is_some_and(|running| running.run_id == run_id)
        {
            self.in_flight.remove(key);
        }
        if success {
            self.last_refresh = Some(Utc::now());
            self.error_count = 0;
        } else {
            self.error_count += 1;
        }
        self.last_executed_at.insert(key.to_string(), now);

        let horizon = self.longest_cooldown;
        self.last_executed_at
            .retain(|_, at| now.saturating_duration_since(*at) < horizon);
        self.publish();
    }

    /// Drop `key` from the pending set and abort its task.
    fn cancel(&mut self, key: &str) -> Option<String> {
        let running = self.in_flight.remove(key)?;
        running.abort.abort();
        Some(running.run_id)
    }

    fn stats(&self) -> RefreshStats {
        let mut pending_keys: Vec<String> = self.in_flight.keys().cloned().collect();
        pending_keys.sort();
        RefreshStats {
            pending_count: pending_keys.len(),
            pending_keys,
            last_refresh: self.last_refresh,
            error_count: self.error_count,
        }
    }

    fn publish(&self) {
        self.updates.send_replace(self.stats());
    }
}

fn settle<T: Clone>(state: &Mutex<DedupState<T>>, key: &str, run_id: &str, success: bool) {
    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    state.settle(key, run_id, success, Instant::now());
}

enum Step<T: Clone> {
    Await(SharedRefresh<T>),
    Wait(SharedRefresh<T>),
    CoolingDown(Duration),
}

/// Front door for remote refreshes; delegates execution to a
/// [`ResilientOperationExecutor`] and timing to a [`PerformanceRecorder`].
pub struct OperationDeduplicator<T: Clone + Send + Sync + 'static> {
    executor: Arc<ResilientOperationExecutor>,
    recorder: Arc<PerformanceRecorder>,
    defaults: RefreshDefaults,
    state: Arc<Mutex<DedupState<T>>>,
}

impl<T: Clone + Send + Sync + 'static> OperationDeduplicator<T> {
    pub fn new(
        executor: Arc<ResilientOperationExecutor>,
        recorder: Arc<PerformanceRecorder>,
        defaults: RefreshDefaults,
    ) -> Self {
        Self {
            executor,
            recorder,
            defaults,
            state: Arc::new(Mutex::new(DedupState::new())),
        }
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(
            Arc::new(ResilientOperationExecutor::from_config(config)),
            Arc::new(PerformanceRecorder::new(config.recorder.clone())),
            config.refresh.clone(),
        )
    }

    pub fn executor(&self) -> &Arc<ResilientOperationExecutor> {
        &self.executor
    }

    pub fn recorder(&self) -> &Arc<PerformanceRecorder> {
        &self.recorder
    }

    pub fn in_flight_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight.len()
    }

    pub fn stats(&self) -> RefreshStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stats()
    }

    /// Follow [`RefreshStats`] as refreshes start, settle or are cancelled.
    /// The receiver starts out holding the current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<RefreshStats> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.updates.subscribe()
    }

    /// Abort the pending refresh for `key`. Callers waiting on it receive
    /// [`ResilienceError::Aborted`]. Returns false when nothing was pending.
    pub fn cancel(&self, key: &str) -> bool {
        let run_id = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let run_id = state.cancel(key);
            if run_id.is_some() {
                state.publish();
            }
            run_id
        };
        let Some(run_id) = run_id else {
            return false;
        };
        tracing::info!(key, "pending refresh cancelled");
        self.recorder
            .complete(&run_id, false, Some("cancelled"), Map::new());
        true
    }

    /// Abort every pending refresh. Returns how many were cancelled.
    pub fn clear_all(&self) -> usize {
        let run_ids: Vec<String> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<String> = state.in_flight.keys().cloned().collect();
            let run_ids: Vec<String> = keys.iter().filter_map(|key| state.cancel(key)).collect();
            state.publish();
            run_ids
        };
        tracing::info!(cancelled = run_ids.len(), "all pending refreshes cleared");
        for run_id in &run_ids {
            self.recorder
                .complete(run_id, false, Some("cancelled"), Map::new());
        }
        run_ids.len()
    }

    /// Run `operation` for `descriptor` unless an identical run is already in
    /// flight (its result is shared) or the key is cooling down.
    pub async fn refresh<F, Fut>(
        &self,
        descriptor: &OperationDescriptor,
        operation: F,
    ) -> Result<RefreshOutcome<T>, ResilienceError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
    {
        let key = descriptor.key();
        let cooldown = descriptor
            .cooldown
            .filter(|cooldown| !cooldown.is_zero())
            .unwrap_or(self.defaults.cooldown);
        let timeout = descriptor.timeout.unwrap_or(self.defaults.timeout);
        let mut pending = Some(operation);

        loop {
            let step = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                match state.admit(&key, &descriptor.operation_type, cooldown, Instant::now()) {
                    Admission::Join(shared) => {
                        tracing::debug!(key = %key, "joining in-flight operation");
                        Step::Await(shared)
                    }
                    Admission::WaitForType(shared) => Step::Wait(shared),
                    Admission::CoolingDown(retry_in) => Step::CoolingDown(retry_in),
                    Admission::Run => {
                        let Some(operation) = pending.take() else {
                            return Err(ResilienceError::Aborted {
                                key,
                                message: "operation already consumed".to_string(),
                            });
                        };
                        let run = self.launch(
                            key.clone(),
                            descriptor.operation_type.clone(),
                            timeout,
                            operation,
                        );
                        let shared = run.future.clone();
                        state.in_flight.insert(key.clone(), run);
                        state.publish();
                        Step::Await(shared)
                    }
                }
            };

            match step {
                Step::Await(shared) => return shared.await.map(RefreshOutcome::Completed),
                Step::Wait(shared) => {
                    tracing::debug!(
                        key = %key,
                        operation_type = %descriptor.operation_type,
                        "waiting for same-type operation to settle"
                    );
                    let _ = shared.await;
                }
                Step::CoolingDown(retry_in) => {
                    tracing::debug!(
                        key = %key,
                        retry_in_ms = retry_in.as_millis() as u64,
                        "refresh suppressed by cooldown"
                    );
                    return Ok(RefreshOutcome::CoolingDown { retry_in });
                }
            }
        }
    }

    /// Spawn the execution so it settles even if every caller goes away.
    fn launch<F, Fut>(
        &self,
        key: String,
        operation_type: String,
        timeout: Duration,
        operation: F,
    ) -> InFlight<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
    {
        let executor = Arc::clone(&self.executor);
        let recorder = Arc::clone(&self.recorder);
        let state = Arc::clone(&self.state);
        let run_id = Uuid::now_v7().to_string();
        let task_key = key.clone();
        let task_run_id = run_id.clone();
        let task_operation_type = operation_type.clone();

        let handle = tokio::spawn(async move {
            let mut metadata = Map::new();
            metadata.insert("key".to_string(), json!(task_key));
            metadata.insert("timeout_ms".to_string(), json!(timeout.as_millis() as u64));
            recorder.start(&task_run_id, &task_operation_type, metadata);

            let result = executor
                .execute(&task_key, || {
                    let attempt = operation();
                    async move {
                        match tokio::time::timeout(timeout, attempt).await {
                            Ok(outcome) => outcome,
                            Err(_) => Err(OperationError::Timeout(timeout)),
                        }
                    }
                })
                .await;

            let error = result.as_ref().err().map(ToString::to_string);
            recorder.complete(&task_run_id, result.is_ok(), error.as_deref(), Map::new());
            settle(&state, &task_key, &task_run_id, result.is_ok());
            result
        });
        let abort = handle.abort_handle();

        let state = Arc::clone(&self.state);
        let settle_run_id = run_id.clone();
        let future = async move {
            match handle.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_cancelled() => Err(ResilienceError::Aborted {
                    key,
                    message: "refresh cancelled".to_string(),
                }),
                Err(join_err) => {
                    settle(&state, &key, &settle_run_id, false);
                    Err(ResilienceError::Aborted {
                        key,
                        message: join_err.to_string(),
                    })
                }
            }
        }
        .boxed()
        .shared();

        InFlight {
            operation_type,
            run_id,
            abort,
            future,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::{CircuitBreakerConfig, RecorderConfig, RetryPolicy};

    fn dedup<T: Clone + Send + Sync + 'static>(max_retries: u32) -> OperationDeduplicator<T> {
        dedup_with(max_retries, RefreshDefaults::default())
    }

    fn dedup_without_cooldown<T: Clone + Send + Sync + 'static>(
        max_retries: u32,
    ) -> OperationDeduplicator<T> {
        dedup_with(
            max_retries,
            RefreshDefaults {
                cooldown: Duration::ZERO,
                ..RefreshDefaults::default()
            },
        )
    }

    fn dedup_with<T: Clone + Send + Sync + 'static>(
        max_retries: u32,
        defaults: RefreshDefaults,
    ) -> OperationDeduplicator<T> {
        let policy = RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
            ..RetryPolicy::default()
        };
        OperationDeduplicator::new(
            Arc::new(ResilientOperationExecutor::new(
                policy,
                CircuitBreakerConfig::default(),
            )),
            Arc::new(PerformanceRecorder::new(RecorderConfig::default())),
            defaults,
        )
    }

    /// Counts invocations; the first one hangs for `first_call` before
    /// resolving to the call number.
    fn counted_op(
        calls: &Arc<AtomicUsize>,
        first_call: Duration,
    ) -> impl Fn() -> BoxFuture<'static, Result<usize, OperationError>> + Clone + Send + Sync + 'static
    {
        let calls = Arc::clone(calls);
        move || {
            let calls = Arc::clone(&calls);
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call == 0 {
                    tokio::time::sleep(first_call).await;
                }
                Ok(call + 1)
            }
            .boxed()
        }
    }

    #[test]
    fn operation_key_sorts_nested_object_keys() {
        let a = operation_key("update", &json!({"b": 1, "a": {"d": 2, "c": [3, {"z": 1, "y": 2}]}}));
        let b = operation_key("update", &json!({"a": {"c": [3, {"y": 2, "z": 1}], "d": 2}, "b": 1}));
        assert_eq!(a, b);
        assert_eq!(a, r#"update:{"a":{"c":[3,{"y":2,"z":1}],"d":2},"b":1}"#);
    }

    #[tokio::test]
    async fn concurrent_identical_refreshes_share_one_execution() {
        let dedup = dedup::<u32>(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let op = move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(7)
            }
        };
        let descriptor = OperationDescriptor::new("fetch_clients", json!({"trainer": 1}));

        let (first, second) = tokio::join!(
            dedup.refresh(&descriptor, op.clone()),
            dedup.refresh(&descriptor, op)
        );

        assert_eq!(first.unwrap(), RefreshOutcome::Completed(7));
        assert_eq!(second.unwrap(), RefreshOutcome::Completed(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn same_type_different_keys_do_not_overlap() {
        let dedup = dedup::<()>(0);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let make_op = || {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let runs = Arc::clone(&runs);
            move || {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                let runs = Arc::clone(&runs);
                async move {
                    let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now_active, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        };

        let first = OperationDescriptor::new("update_workout", json!({"id": 1}));
        let second = OperationDescriptor::new("update_workout", json!({"id": 2}));
        let (a, b) = tokio::join!(
            dedup.refresh(&first, make_op()),
            dedup.refresh(&second, make_op())
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cooldown_suppresses_rerun() {
        let dedup = dedup::<&'static str>(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let op = move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("fresh")
            }
        };
        let descriptor = OperationDescriptor::new("fetch_metrics", json!({}))
            .with_cooldown(Duration::from_secs(10));

        let first = dedup.refresh(&descriptor, op.clone()).await.unwrap();
        let second = dedup.refresh(&descriptor, op).await.unwrap();

        assert_eq!(first.completed(), Some("fresh"));
        assert!(matches!(second, RefreshOutcome::CoolingDown { retry_in } if retry_in <= Duration::from_secs(10)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn each_attempt_races_the_timeout() {
        let dedup = dedup::<u8>(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let descriptor = OperationDescriptor::new("fetch_plan", json!({"client": "c1"}))
            .with_timeout(Duration::from_millis(20));

        let err = dedup
            .refresh(&descriptor, move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(1)
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            err.operation_error(),
            Some(&OperationError::Timeout(Duration::from_millis(20)))
        );
        assert_eq!(dedup.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn failures_settle_and_are_recorded() {
        let dedup = dedup_without_cooldown::<u8>(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let op = move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(OperationError::status(400, "bad request"))
            }
        };
        let descriptor = OperationDescriptor::new("delete_exercise", json!({"id": 9}));

        assert!(dedup.refresh(&descriptor, op.clone()).await.is_err());
        assert!(dedup.refresh(&descriptor, op).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let metrics = dedup.recorder().metrics();
        assert_eq!(metrics.len(), 2);
        assert!(metrics.iter().all(|metric| !metric.success));
        assert_eq!(metrics[0].operation_type, "delete_exercise");
        assert_eq!(metrics[0].metadata["key"], descriptor.key());

        assert_eq!(dedup.executor().failure_count(&descriptor.key()), 2);
        let stats = dedup.stats();
        assert_eq!(stats.error_count, 2);
        assert_eq!(stats.last_refresh, None);
    }

    #[tokio::test]
    async fn default_cooldown_suppresses_back_to_back_refreshes() {
        let dedup = dedup::<usize>(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let op = counted_op(&calls, Duration::ZERO);
        let descriptor = OperationDescriptor::new("fetch_status", json!({"client": "c1"}));

        let first = dedup.refresh(&descriptor, op.clone()).await.unwrap();
        let second = dedup.refresh(&descriptor, op.clone()).await.unwrap();
        let zero = descriptor.clone().with_cooldown(Duration::ZERO);
        let third = dedup.refresh(&zero, op).await.unwrap();

        assert_eq!(first, RefreshOutcome::Completed(1));
        assert!(matches!(second, RefreshOutcome::CoolingDown { retry_in } if retry_in <= Duration::from_millis(1000)));
        assert!(matches!(third, RefreshOutcome::CoolingDown { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_aborts_pending_refresh_and_frees_the_key() {
        let dedup = dedup::<usize>(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let op = counted_op(&calls, Duration::from_secs(10));
        let descriptor = OperationDescriptor::new("save_plan", json!({"client": "c1"}));
        let key = descriptor.key();

        let (result, cancelled) = tokio::join!(dedup.refresh(&descriptor, op.clone()), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            dedup.cancel(&key)
        });

        assert!(cancelled);
        assert!(matches!(result, Err(ResilienceError::Aborted { .. })));
        assert_eq!(dedup.in_flight_count(), 0);
        assert!(!dedup.cancel(&key));

        let metrics = dedup.recorder().metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].error.as_deref(), Some("cancelled"));
        assert_eq!(dedup.recorder().active_count(), 0);

        // a cancelled run does not start the cooldown
        let rerun = dedup.refresh(&descriptor, op).await.unwrap();
        assert_eq!(rerun, RefreshOutcome::Completed(2));
    }

    #[tokio::test]
    async fn clear_all_cancels_every_pending_refresh() {
        let dedup = dedup::<usize>(0);
        let plan_calls = Arc::new(AtomicUsize::new(0));
        let status_calls = Arc::new(AtomicUsize::new(0));
        let plan = OperationDescriptor::new("save_plan", json!({"client": "c1"}));
        let status = OperationDescriptor::new("fetch_status", json!({"client": "c1"}));

        let (a, b, cleared) = tokio::join!(
            dedup.refresh(&plan, counted_op(&plan_calls, Duration::from_secs(10))),
            dedup.refresh(&status, counted_op(&status_calls, Duration::from_secs(10))),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                dedup.clear_all()
            }
        );

        assert_eq!(cleared, 2);
        assert!(a.is_err() && b.is_err());
        assert_eq!(dedup.stats().pending_count, 0);
        assert_eq!(dedup.clear_all(), 0);
    }

    #[tokio::test]
    async fn stats_follow_pending_keys_successes_and_errors() {
        let dedup = dedup::<usize>(0);
        let mut updates = dedup.subscribe();
        assert_eq!(*updates.borrow(), RefreshStats::default());

        let calls = Arc::new(AtomicUsize::new(0));
        let descriptor = OperationDescriptor::new("fetch_plan", json!({"client": "c1"}));
        let (result, pending) = tokio::join!(
            dedup.refresh(&descriptor, counted_op(&calls, Duration::from_millis(40))),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                dedup.stats()
            }
        );
        assert!(result.is_ok());
        assert_eq!(pending.pending_count, 1);
        assert_eq!(pending.pending_keys, vec![descriptor.key()]);

        let settled = dedup.stats();
        assert_eq!(settled.pending_count, 0);
        assert!(settled.last_refresh.is_some());
        assert_eq!(settled.error_count, 0);

        let failing = OperationDescriptor::new("delete_exercise", json!({"id": 3}));
        let _ = dedup
            .refresh(&failing, || async {
                Err::<usize, _>(OperationError::status(404, "missing"))
            })
            .await;

        assert!(updates.has_changed().unwrap());
        let latest = updates.borrow_and_update().clone();
        assert_eq!(latest.error_count, 1);
        assert_eq!(latest.last_refresh, settled.last_refresh);
    }

    #[test]
    fn settle_prunes_entries_past_the_longest_cooldown() {
        let mut state = DedupState::<u8>::new();
        let start = Instant::now();
        let _ = state.admit("fetch:{}", "fetch", Duration::from_millis(100), start);

        state.settle("fetch:{}", "run-1", true, start);
        state.settle("save:{}", "run-2", true, start + Duration::from_millis(150));

        assert!(!state.last_executed_at.contains_key("fetch:{}"));
        assert!(state.last_executed_at.contains_key("save:{}"));
    }
}
