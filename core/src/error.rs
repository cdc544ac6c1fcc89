use serde::Serialize;
use thiserror::Error;

/// Structured error body printed by tools and returned to integrating layers.
/// Every error carries enough information to decide whether to retry,
/// fix the input, or give up.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    /// Machine-readable error code (e.g. "plan_unrecoverable", "circuit_open")
    pub error: String,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Which input caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Hint about what to do next
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(error: &str, message: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            message: message.into(),
            field: None,
            received: None,
            docs_hint: None,
        }
    }

    pub fn with_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }

    pub fn with_received(mut self, received: serde_json::Value) -> Self {
        self.received = Some(received);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.docs_hint = Some(hint.into());
        self
    }
}

/// Error codes shared by the workspace crates
pub mod codes {
    pub const PLAN_UNRECOVERABLE: &str = "plan_unrecoverable";
    pub const PLAN_PARTIAL: &str = "plan_partial";
    pub const CIRCUIT_OPEN: &str = "circuit_open";
    pub const OPERATION_FAILED: &str = "operation_failed";
    pub const CONNECTION_ERROR: &str = "connection_error";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const CLI_ERROR: &str = "cli_error";
}

/// Failure of the plan recovery pipeline. Partial recoveries are not errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("workout plan response could not be recovered ({reason}); please retry plan generation")]
    Unrecoverable {
        reason: String,
        model: Option<String>,
    },
}

impl RecoveryError {
    pub fn reason(&self) -> &str {
        match self {
            RecoveryError::Unrecoverable { reason, .. } => reason,
        }
    }
}

impl From<&RecoveryError> for ErrorEnvelope {
    fn from(err: &RecoveryError) -> Self {
        let envelope = ErrorEnvelope::new(codes::PLAN_UNRECOVERABLE, err.to_string())
            .with_hint("Regenerate the plan; the model output was not usable JSON.");
        match err {
            RecoveryError::Unrecoverable {
                model: Some(model), ..
            } => envelope.with_received(serde_json::json!({ "model": model })),
            RecoveryError::Unrecoverable { .. } => envelope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecoverable_error_asks_for_retry() {
        let err = RecoveryError::Unrecoverable {
            reason: "no JSON object found in response".to_string(),
            model: None,
        };
        let message = err.to_string();
        assert!(message.contains("no JSON object found"));
        assert!(message.contains("please retry plan generation"));
        assert_eq!(err.reason(), "no JSON object found in response");
    }

    #[test]
    fn envelope_omits_empty_optional_fields() {
        let err = RecoveryError::Unrecoverable {
            reason: "unbalanced braces".to_string(),
            model: None,
        };
        let body = serde_json::to_value(ErrorEnvelope::from(&err)).unwrap();
        assert_eq!(body["error"], codes::PLAN_UNRECOVERABLE);
        assert!(body.get("field").is_none());
        assert!(body.get("received").is_none());
        assert!(body.get("docs_hint").is_some());
    }

    #[test]
    fn envelope_echoes_model_identifier() {
        let err = RecoveryError::Unrecoverable {
            reason: "unbalanced braces".to_string(),
            model: Some("coach-large".to_string()),
        };
        let body = serde_json::to_value(ErrorEnvelope::from(&err)).unwrap();
        assert_eq!(body["received"]["model"], "coach-large");
    }
}
