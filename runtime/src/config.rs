use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::OperationError;

pub const MAX_RETRIES_ENV: &str = "SPOTTER_MAX_RETRIES";
pub const BASE_DELAY_MS_ENV: &str = "SPOTTER_BASE_DELAY_MS";
pub const MAX_DELAY_MS_ENV: &str = "SPOTTER_MAX_DELAY_MS";
pub const BACKOFF_MULTIPLIER_ENV: &str = "SPOTTER_BACKOFF_MULTIPLIER";
pub const JITTER_ENV: &str = "SPOTTER_JITTER";
pub const FAILURE_THRESHOLD_ENV: &str = "SPOTTER_FAILURE_THRESHOLD";
pub const RECOVERY_TIMEOUT_MS_ENV: &str = "SPOTTER_RECOVERY_TIMEOUT_MS";
pub const REFRESH_TIMEOUT_MS_ENV: &str = "SPOTTER_REFRESH_TIMEOUT_MS";
pub const REFRESH_COOLDOWN_MS_ENV: &str = "SPOTTER_REFRESH_COOLDOWN_MS";
pub const SLOW_OPERATION_MS_ENV: &str = "SPOTTER_SLOW_OPERATION_MS";

const MAX_RETRIES_MAX: u32 = 10;
const DELAY_MS_MAX: u64 = 120_000;
const BACKOFF_MULTIPLIER_MIN: f64 = 1.0;
const BACKOFF_MULTIPLIER_MAX: f64 = 10.0;
const FAILURE_THRESHOLD_MAX: u32 = 100;
const RECOVERY_TIMEOUT_MS_MAX: u64 = 600_000;
const REFRESH_TIMEOUT_MS_MIN: u64 = 100;
const REFRESH_TIMEOUT_MS_MAX: u64 = 300_000;
const REFRESH_COOLDOWN_MS_MAX: u64 = 3_600_000;
const SLOW_OPERATION_MS_MAX: u64 = 600_000;

/// Decides whether a failed attempt should be retried.
#[derive(Clone)]
pub struct RetryPredicate(Arc<dyn Fn(&OperationError) -> bool + Send + Sync>);

impl RetryPredicate {
    pub fn new(predicate: impl Fn(&OperationError) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    pub fn should_retry(&self, err: &OperationError) -> bool {
        (self.0)(err)
    }
}

impl Default for RetryPredicate {
    fn default() -> Self {
        Self::new(OperationError::is_retryable)
    }
}

impl fmt::Debug for RetryPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryPredicate(..)")
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub should_retry: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            jitter: true,
            should_retry: RetryPredicate::default(),
        }
    }
}

impl RetryPolicy {
    pub fn with_should_retry(
        mut self,
        predicate: impl Fn(&OperationError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = RetryPredicate::new(predicate);
        self
    }

    /// Delay before retry number `attempt` (0-based), scaled by a jitter
    /// factor. Capped at `max_delay` before scaling.
    pub fn delay_for(&self, attempt: u32, jitter_factor: f64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw_ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis((capped_ms * jitter_factor.clamp(0.0, 1.0)).round() as u64)
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            1.0
        };
        self.delay_for(attempt, factor)
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time since the last failure before a trial call is let through
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Defaults for descriptors that leave `timeout`/`cooldown` unset. A zero
/// descriptor cooldown also falls back to `cooldown`; a zero default disables
/// suppression.
#[derive(Debug, Clone)]
pub struct RefreshDefaults {
    pub timeout: Duration,
    pub cooldown: Duration,
}

impl Default for RefreshDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(15_000),
            cooldown: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Completed metrics retained, oldest evicted first
    pub metrics_capacity: usize,
    pub alerts_capacity: usize,
    pub slow_operation_threshold: Duration,
    /// How many recent operations of a type feed the error rate
    pub error_rate_window: usize,
    pub error_rate_threshold: f64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            metrics_capacity: 1000,
            alerts_capacity: 100,
            slow_operation_threshold: Duration::from_millis(5000),
            error_rate_window: 10,
            error_rate_threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResilienceConfig {
    pub retry: RetryPolicy,
    pub circuit: CircuitBreakerConfig,
    pub refresh: RefreshDefaults,
    pub recorder: RecorderConfig,
    /// True when at least one value came from the environment
    pub configured_via_env: bool,
}

impl ResilienceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from raw values. Unparseable values fall back to defaults and
    /// numeric values are clamped to sane bounds.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let retry_defaults = &defaults.retry;

        let (max_retries, retries_set) = parse_env_u32_with_bounds(
            lookup(MAX_RETRIES_ENV),
            0,
            MAX_RETRIES_MAX,
            retry_defaults.max_retries,
        );
        let (base_delay_ms, base_set) = parse_env_u64_with_bounds(
            lookup(BASE_DELAY_MS_ENV),
            0,
            DELAY_MS_MAX,
            retry_defaults.base_delay.as_millis() as u64,
        );
        let (max_delay_ms, max_set) = parse_env_u64_with_bounds(
            lookup(MAX_DELAY_MS_ENV),
            base_delay_ms,
            DELAY_MS_MAX.max(base_delay_ms),
            (retry_defaults.max_delay.as_millis() as u64).max(base_delay_ms),
        );
        let (backoff_multiplier, multiplier_set) = parse_env_f64_with_bounds(
            lookup(BACKOFF_MULTIPLIER_ENV),
            BACKOFF_MULTIPLIER_MIN,
            BACKOFF_MULTIPLIER_MAX,
            retry_defaults.backoff_multiplier,
        );
        let jitter_raw = lookup(JITTER_ENV);
        let jitter_set = jitter_raw.is_some();
        let jitter = parse_env_bool_flag(jitter_raw, retry_defaults.jitter);

        let (failure_threshold, threshold_set) = parse_env_u32_with_bounds(
            lookup(FAILURE_THRESHOLD_ENV),
            1,
            FAILURE_THRESHOLD_MAX,
            defaults.circuit.failure_threshold,
        );
        let (recovery_timeout_ms, recovery_set) = parse_env_u64_with_bounds(
            lookup(RECOVERY_TIMEOUT_MS_ENV),
            0,
            RECOVERY_TIMEOUT_MS_MAX,
            defaults.circuit.recovery_timeout.as_millis() as u64,
        );
        let (refresh_timeout_ms, timeout_set) = parse_env_u64_with_bounds(
            lookup(REFRESH_TIMEOUT_MS_ENV),
            REFRESH_TIMEOUT_MS_MIN,
            REFRESH_TIMEOUT_MS_MAX,
            defaults.refresh.timeout.as_millis() as u64,
        );
        let (refresh_cooldown_ms, cooldown_set) = parse_env_u64_with_bounds(
            lookup(REFRESH_COOLDOWN_MS_ENV),
            0,
            REFRESH_COOLDOWN_MS_MAX,
            defaults.refresh.cooldown.as_millis() as u64,
        );
        let (slow_operation_ms, slow_set) = parse_env_u64_with_bounds(
            lookup(SLOW_OPERATION_MS_ENV),
            1,
            SLOW_OPERATION_MS_MAX,
            defaults.recorder.slow_operation_threshold.as_millis() as u64,
        );

        Self {
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(base_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms),
                backoff_multiplier,
                jitter,
                should_retry: RetryPredicate::default(),
            },
            circuit: CircuitBreakerConfig {
                failure_threshold,
                recovery_timeout: Duration::from_millis(recovery_timeout_ms),
            },
            refresh: RefreshDefaults {
                timeout: Duration::from_millis(refresh_timeout_ms),
                cooldown: Duration::from_millis(refresh_cooldown_ms),
            },
            recorder: RecorderConfig {
                slow_operation_threshold: Duration::from_millis(slow_operation_ms),
                ..defaults.recorder.clone()
            },
            configured_via_env: retries_set
                || base_set
                || max_set
                || multiplier_set
                || jitter_set
                || threshold_set
                || recovery_set
                || timeout_set
                || cooldown_set
                || slow_set,
        }
    }
}

fn parse_env_bool_flag(raw: Option<String>, default: bool) -> bool {
    match raw {
        Some(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

fn parse_env_u64_with_bounds(raw: Option<String>, min: u64, max: u64, default: u64) -> (u64, bool) {
    match raw.and_then(|value| value.trim().parse::<u64>().ok()) {
        Some(parsed) => (parsed.clamp(min, max), true),
        None => (default, false),
    }
}

fn parse_env_u32_with_bounds(raw: Option<String>, min: u32, max: u32, default: u32) -> (u32, bool) {
    match raw.and_then(|value| value.trim().parse::<u32>().ok()) {
        Some(parsed) => (parsed.clamp(min, max), true),
        None => (default, false),
    }
}

fn parse_env_f64_with_bounds(raw: Option<String>, min: f64, max: f64, default: f64) -> (f64, bool) {
    match raw
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|parsed| parsed.is_finite())
    {
        Some(parsed) => (parsed.clamp(min, max), true),
        None => (default, false),
    }
}
