use std::io::Read;

use serde::Serialize;
use serde_json::json;
use spotter_core::error::{ErrorEnvelope, codes};
use spotter_runtime::{OperationError, ResilienceError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit codes: 0=success, 1=client error / unusable input, 2=server error,
///             3=connection error or open circuit, 4=usage error
pub const EXIT_OK: i32 = 0;
pub const EXIT_CLIENT_ERROR: i32 = 1;
pub const EXIT_SERVER_ERROR: i32 = 2;
pub const EXIT_CONNECTION_ERROR: i32 = 3;
pub const EXIT_USAGE_ERROR: i32 = 4;

/// JSON logs go to stderr so stdout stays machine-readable.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spotter=info,spotter_core=info,spotter_runtime=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .try_init();
}

pub fn print_json<T: Serialize>(value: &T) -> i32 {
    match serde_json::to_string_pretty(value) {
        Ok(formatted) => {
            println!("{formatted}");
            EXIT_OK
        }
        Err(e) => {
            print_error(&ErrorEnvelope::new(
                codes::INTERNAL_ERROR,
                format!("Failed to serialize output: {e}"),
            ));
            EXIT_SERVER_ERROR
        }
    }
}

pub fn print_error(envelope: &ErrorEnvelope) {
    let formatted = serde_json::to_string_pretty(envelope)
        .unwrap_or_else(|_| json!({"error": envelope.error, "message": envelope.message}).to_string());
    eprintln!("{formatted}");
}

pub fn usage_error(message: &str, docs_hint: Option<&str>) -> i32 {
    let mut envelope = ErrorEnvelope::new(codes::CLI_ERROR, message);
    if let Some(hint) = docs_hint {
        envelope = envelope.with_hint(hint);
    }
    print_error(&envelope);
    EXIT_USAGE_ERROR
}

/// Read text from a file path or stdin (when path is "-").
pub fn read_input(path: &str) -> Result<String, String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("Failed to read stdin: {e}"))?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).map_err(|e| format!("Failed to read file '{path}': {e}"))
}

pub fn resilience_exit_code(err: &ResilienceError) -> i32 {
    match err {
        ResilienceError::CircuitOpen { .. } => EXIT_CONNECTION_ERROR,
        ResilienceError::Failed { source, .. } => match source {
            OperationError::Network(_) | OperationError::Timeout(_) => EXIT_CONNECTION_ERROR,
            OperationError::Status { status, .. } if *status < 500 => EXIT_CLIENT_ERROR,
            _ => EXIT_SERVER_ERROR,
        },
        ResilienceError::Aborted { .. } => EXIT_SERVER_ERROR,
    }
}

pub fn resilience_envelope(err: &ResilienceError) -> ErrorEnvelope {
    let (code, hint) = match err {
        ResilienceError::CircuitOpen { .. } => (
            codes::CIRCUIT_OPEN,
            "The remote has failed repeatedly; wait for the recovery timeout before retrying.",
        ),
        ResilienceError::Failed {
            source: OperationError::Network(_) | OperationError::Timeout(_),
            ..
        } => (
            codes::CONNECTION_ERROR,
            "Is the plan source reachable? Check --url / SPOTTER_PLAN_URL.",
        ),
        ResilienceError::Failed { .. } => (
            codes::OPERATION_FAILED,
            "The plan source rejected the request; check the URL and its response.",
        ),
        ResilienceError::Aborted { .. } => (codes::INTERNAL_ERROR, "Retry the command."),
    };
    ErrorEnvelope::new(code, err.to_string())
        .with_received(json!({ "operation": err.key() }))
        .with_hint(hint)
}
