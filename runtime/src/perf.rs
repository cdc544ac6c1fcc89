use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::config::RecorderConfig;

const SLOW_OPERATION_CRITICAL_MS: u64 = 10_000;
const ERROR_RATE_CRITICAL: f64 = 0.5;
const DASHBOARD_ALERTS: usize = 5;
const DASHBOARD_SLOWEST: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceMetric {
    pub operation_id: String,
    pub operation_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PerformanceAlert {
    SlowOperation {
        operation_id: String,
        operation_type: String,
        duration_ms: u64,
        threshold_ms: u64,
        severity: AlertSeverity,
        at: DateTime<Utc>,
    },
    HighErrorRate {
        operation_type: String,
        failures: usize,
        window: usize,
        error_rate: f64,
        severity: AlertSeverity,
        at: DateTime<Utc>,
    },
}

impl PerformanceAlert {
    pub fn severity(&self) -> AlertSeverity {
        match self {
            PerformanceAlert::SlowOperation { severity, .. }
            | PerformanceAlert::HighErrorRate { severity, .. } => *severity,
        }
    }

    pub fn operation_type(&self) -> &str {
        match self {
            PerformanceAlert::SlowOperation { operation_type, .. }
            | PerformanceAlert::HighErrorRate { operation_type, .. } => operation_type,
        }
    }
}

/// Aggregate view over the retained metrics of one operation type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSummary {
    pub operation_type: String,
    pub count: usize,
    pub failures: usize,
    pub average_duration_ms: u64,
    pub max_duration_ms: u64,
}

/// Distribution of retained metrics across all operation types.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub total_operations: usize,
    pub successful_operations: usize,
    pub failed_operations: usize,
    pub average_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub p95_duration_ms: u64,
    pub p99_duration_ms: u64,
    pub operations_per_minute: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub stats: PerformanceStats,
    pub recent_alerts: Vec<PerformanceAlert>,
    /// Operation types ordered by average duration, slowest first
    pub slowest_operations: Vec<OperationSummary>,
}

struct ActiveOperation {
    operation_type: String,
    started: Instant,
    start_time: DateTime<Utc>,
    metadata: Map<String, Value>,
}

#[derive(Default)]
struct RecorderState {
    active: HashMap<String, ActiveOperation>,
    metrics: VecDeque<PerformanceMetric>,
    alerts: VecDeque<PerformanceAlert>,
}

/// Side observer for instrumented operations. Alerts are logged and kept;
/// they never influence execution.
pub struct PerformanceRecorder {
    config: RecorderConfig,
    state: Mutex<RecorderState>,
}

impl Default for PerformanceRecorder {
    fn default() -> Self {
        Self::new(RecorderConfig::default())
    }
}

impl PerformanceRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RecorderState::default()),
        }
    }

    /// Begin timing `operation_id`. Returns `metadata` enriched with the
    /// operation id and start timestamp.
    pub fn start(
        &self,
        operation_id: &str,
        operation_type: &str,
        mut metadata: Map<String, Value>,
    ) -> Map<String, Value> {
        let start_time = Utc::now();
        metadata.insert("operation_id".to_string(), json!(operation_id));
        metadata.insert("started_at".to_string(), json!(start_time.to_rfc3339()));

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active.insert(
            operation_id.to_string(),
            ActiveOperation {
                operation_type: operation_type.to_string(),
                started: Instant::now(),
                start_time,
                metadata: metadata.clone(),
            },
        );
        metadata
    }

    /// Finish timing. Returns `None` for ids that were never started.
    pub fn complete(
        &self,
        operation_id: &str,
        success: bool,
        error: Option<&str>,
        metadata: Map<String, Value>,
    ) -> Option<PerformanceMetric> {
        self.complete_at(operation_id, success, error, metadata, Instant::now())
    }

    fn complete_at(
        &self,
        operation_id: &str,
        success: bool,
        error: Option<&str>,
        metadata: Map<String, Value>,
        now: Instant,
    ) -> Option<PerformanceMetric> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(active) = state.active.remove(operation_id) else {
            tracing::debug!(operation_id, "completion for unknown operation ignored");
            return None;
        };

        let duration = now.saturating_duration_since(active.started);
        let mut merged = active.metadata;
        merged.extend(metadata);
        let metric = PerformanceMetric {
            operation_id: operation_id.to_string(),
            operation_type: active.operation_type,
            start_time: active.start_time,
            end_time: active.start_time
                + TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::zero()),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            success,
            error: error.map(str::to_string),
            metadata: merged,
        };

        push_capped(&mut state.metrics, metric.clone(), self.config.metrics_capacity);
        for alert in evaluate_alerts(&self.config, &state.metrics, &metric) {
            log_alert(&alert);
            push_capped(&mut state.alerts, alert, self.config.alerts_capacity);
        }
        Some(metric)
    }

    pub fn metrics(&self) -> Vec<PerformanceMetric> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.metrics.iter().cloned().collect()
    }

    pub fn alerts(&self) -> Vec<PerformanceAlert> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.alerts.iter().cloned().collect()
    }

    /// The newest `count` alerts, oldest first.
    pub fn recent_alerts(&self, count: usize) -> Vec<PerformanceAlert> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let skip = state.alerts.len().saturating_sub(count);
        state.alerts.iter().skip(skip).cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active.len()
    }

    pub fn summary(&self, operation_type: &str) -> OperationSummary {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        summarize(operation_type, state.metrics.iter())
    }

    /// Stats over metrics that started within `window` of now, or over
    /// everything retained when `window` is `None`.
    pub fn stats(&self, window: Option<Duration>) -> PerformanceStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        stats_since(&state.metrics, window, Utc::now())
    }

    pub fn dashboard(&self) -> DashboardSummary {
        let stats = self.stats(None);
        let recent_alerts = self.recent_alerts(DASHBOARD_ALERTS);

        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut types: Vec<&str> = state
            .metrics
            .iter()
            .map(|metric| metric.operation_type.as_str())
            .collect();
        types.sort_unstable();
        types.dedup();
        let mut slowest_operations: Vec<OperationSummary> = types
            .into_iter()
            .map(|operation_type| summarize(operation_type, state.metrics.iter()))
            .collect();
        slowest_operations.sort_by(|a, b| b.average_duration_ms.cmp(&a.average_duration_ms));
        slowest_operations.truncate(DASHBOARD_SLOWEST);

        DashboardSummary {
            stats,
            recent_alerts,
            slowest_operations,
        }
    }

    /// Everything retained, as one JSON document.
    pub fn export(&self) -> Value {
        let stats = self.stats(None);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        json!({
            "metrics": state.metrics,
            "alerts": state.alerts,
            "stats": stats,
            "exported_at": Utc::now().to_rfc3339(),
        })
    }

    /// Drop retained metrics and alerts. Operations still running are kept.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (metrics, alerts) = (state.metrics.len(), state.alerts.len());
        state.metrics.clear();
        state.alerts.clear();
        tracing::info!(metrics, alerts, "performance history cleared");
    }
}

fn push_capped<T>(buffer: &mut VecDeque<T>, item: T, capacity: usize) {
    while capacity > 0 && buffer.len() >= capacity {
        buffer.pop_front();
    }
    buffer.push_back(item);
}

fn summarize<'a>(
    operation_type: &str,
    metrics: impl Iterator<Item = &'a PerformanceMetric>,
) -> OperationSummary {
    let matching: Vec<&PerformanceMetric> = metrics
        .filter(|metric| metric.operation_type == operation_type)
        .collect();
    let count = matching.len();
    let total: u64 = matching.iter().map(|metric| metric.duration_ms).sum();
    OperationSummary {
        operation_type: operation_type.to_string(),
        count,
        failures: matching.iter().filter(|metric| !metric.success).count(),
        average_duration_ms: if count == 0 { 0 } else { total / count as u64 },
        max_duration_ms: matching
            .iter()
            .map(|metric| metric.duration_ms)
            .max()
            .unwrap_or(0),
    }
}

fn stats_since(
    history: &VecDeque<PerformanceMetric>,
    window: Option<Duration>,
    now: DateTime<Utc>,
) -> PerformanceStats {
    let cutoff = window
        .and_then(|window| TimeDelta::from_std(window).ok())
        .and_then(|window| now.checked_sub_signed(window));
    let metrics: Vec<&PerformanceMetric> = history
        .iter()
        .filter(|metric| cutoff.is_none_or(|cutoff| metric.start_time >= cutoff))
        .collect();
    let (Some(first), Some(last)) = (metrics.first(), metrics.last()) else {
        return PerformanceStats::default();
    };

    let total = metrics.len();
    let failed = metrics.iter().filter(|metric| !metric.success).count();
    let mut durations: Vec<u64> = metrics.iter().map(|metric| metric.duration_ms).collect();
    durations.sort_unstable();
    let percentile = |fraction: f64| {
        let index = ((total as f64 * fraction).floor() as usize).min(total - 1);
        durations[index]
    };

    let span_minutes = if total > 1 {
        (last.start_time - first.start_time).num_milliseconds() as f64 / 60_000.0
    } else {
        1.0
    };

    PerformanceStats {
        total_operations: total,
        successful_operations: total - failed,
        failed_operations: failed,
        average_duration_ms: durations.iter().sum::<u64>() as f64 / total as f64,
        min_duration_ms: durations[0],
        max_duration_ms: durations[total - 1],
        p95_duration_ms: percentile(0.95),
        p99_duration_ms: percentile(0.99),
        operations_per_minute: total as f64 / span_minutes.max(1.0),
        error_rate: failed as f64 / total as f64,
    }
}

/// Alerts raised by `latest`, evaluated against the retained history
/// (which already includes `latest`).
fn evaluate_alerts(
    config: &RecorderConfig,
    history: &VecDeque<PerformanceMetric>,
    latest: &PerformanceMetric,
) -> Vec<PerformanceAlert> {
    let mut alerts = Vec::new();

    let threshold_ms = u64::try_from(config.slow_operation_threshold.as_millis()).unwrap_or(u64::MAX);
    if latest.duration_ms > threshold_ms {
        alerts.push(PerformanceAlert::SlowOperation {
            operation_id: latest.operation_id.clone(),
            operation_type: latest.operation_type.clone(),
            duration_ms: latest.duration_ms,
            threshold_ms,
            severity: if latest.duration_ms > SLOW_OPERATION_CRITICAL_MS {
                AlertSeverity::Critical
            } else {
                AlertSeverity::High
            },
            at: latest.end_time,
        });
    }

    // Only judged once a full window of this type has been recorded.
    let recent: Vec<&PerformanceMetric> = history
        .iter()
        .rev()
        .filter(|metric| metric.operation_type == latest.operation_type)
        .take(config.error_rate_window)
        .collect();
    if !recent.is_empty() && recent.len() >= config.error_rate_window {
        let failures = recent.iter().filter(|metric| !metric.success).count();
        let error_rate = failures as f64 / recent.len() as f64;
        if error_rate > config.error_rate_threshold {
            alerts.push(PerformanceAlert::HighErrorRate {
                operation_type: latest.operation_type.clone(),
                failures,
                window: recent.len(),
                error_rate,
                severity: if error_rate > ERROR_RATE_CRITICAL {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::Medium
                },
                at: latest.end_time,
            });
        }
    }
    alerts
}

fn log_alert(alert: &PerformanceAlert) {
    match alert {
        PerformanceAlert::SlowOperation {
            operation_id,
            operation_type,
            duration_ms,
            threshold_ms,
            severity,
            ..
        } => tracing::warn!(
            operation_id = %operation_id,
            operation_type = %operation_type,
            duration_ms,
            threshold_ms,
            ?severity,
            "slow operation"
        ),
        PerformanceAlert::HighErrorRate {
            operation_type,
            failures,
            window,
            error_rate,
            severity,
            ..
        } => tracing::warn!(
            operation_type = %operation_type,
            failures,
            window,
            error_rate,
            ?severity,
            "high error rate"
        ),
    }
}
