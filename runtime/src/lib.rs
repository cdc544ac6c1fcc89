pub mod config;
pub mod dedup;
pub mod error;
pub mod executor;
pub mod perf;

pub use config::{CircuitBreakerConfig, RecorderConfig, RefreshDefaults, ResilienceConfig, RetryPolicy};
pub use dedup::{
    OperationDescriptor, OperationDeduplicator, RefreshOutcome, RefreshStats, operation_key,
};
pub use error::{OperationError, ResilienceError};
pub use executor::{CircuitState, CircuitStatus, ResilientOperationExecutor};
pub use perf::{
    AlertSeverity, DashboardSummary, PerformanceAlert, PerformanceMetric, PerformanceRecorder,
    PerformanceStats,
};
