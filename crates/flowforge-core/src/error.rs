use thiserror::Error;

/// Core error type for the FlowForge engine
///
/// Expected edge cases (stale step references, consumed correlation ids,
/// idempotency guards) are typed variants so callers can distinguish
/// "your request was invalid" from "try again" from "something broke".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Flow not found
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Flow version not found
    #[error("Flow version not found: {0}")]
    VersionNotFound(String),

    /// Addressed step no longer exists (expected under concurrent edits)
    #[error("Step not found: {0}")]
    StepNotFound(String),

    /// Flow run not found, or its correlation id was already consumed
    #[error("Flow run not found: {0}")]
    RunNotFound(String),

    /// No active webhook simulation for the flow
    #[error("Webhook simulation not found for flow: {0}")]
    SimulationNotFound(String),

    /// Imported template violated structural rules; carries every violation
    #[error("Invalid flow template: {}", .0.join("; "))]
    InvalidTemplate(Vec<String>),

    /// Structural validation failure; carries every violated rule
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Timed out waiting for the edit lock; retryable by the caller
    #[error("Timed out acquiring edit lock: {0}")]
    LockTimeout(String),

    /// The executor did not complete before the wall-clock deadline
    #[error("Deadline exceeded for engine operation: {0}")]
    DeadlineExceeded(String),

    /// Another resume attempt already won the race for this correlation id
    #[error("Run already resumed for correlation id: {0}")]
    AlreadyResumed(String),

    /// The run is not in a terminal failed state
    #[error("Run is not retryable: {0}")]
    NotRetryable(String),

    /// Engine request payload exceeds the maximum size
    #[error("Engine payload of {0} bytes exceeds the maximum size")]
    PayloadTooLarge(usize),

    /// No live worker machine is available for dispatch
    #[error("No live worker machine available")]
    NoWorkerAvailable,

    /// State store error
    #[error("State store error: {0}")]
    StateStore(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Unexpected error; logged with context, surfaced as opaque failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the caller should treat this as its own fault (bad input,
    /// stale reference, lost race) rather than a server fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::FlowNotFound(_)
                | EngineError::VersionNotFound(_)
                | EngineError::StepNotFound(_)
                | EngineError::RunNotFound(_)
                | EngineError::SimulationNotFound(_)
                | EngineError::InvalidTemplate(_)
                | EngineError::Validation(_)
                | EngineError::AlreadyResumed(_)
                | EngineError::NotRetryable(_)
                | EngineError::PayloadTooLarge(_)
        )
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::LockTimeout(_) | EngineError::NoWorkerAvailable
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                EngineError::StepNotFound("step_9".to_string()),
                "Step not found: step_9",
            ),
            (
                EngineError::RunNotFound("run1".to_string()),
                "Flow run not found: run1",
            ),
            (
                EngineError::LockTimeout("flow1".to_string()),
                "Timed out acquiring edit lock: flow1",
            ),
            (
                EngineError::AlreadyResumed("abc".to_string()),
                "Run already resumed for correlation id: abc",
            ),
            (
                EngineError::InvalidTemplate(vec!["a".to_string(), "b".to_string()]),
                "Invalid flow template: a; b",
            ),
        ];

        for (error, expected) in errors {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_invalid_template_joins_all_violations() {
        let error = EngineError::InvalidTemplate(vec![
            "trigger: missing display name".to_string(),
            "step_2: duplicate step name".to_string(),
        ]);
        let message = error.to_string();
        assert!(message.contains("missing display name"));
        assert!(message.contains("duplicate step name"));
    }

    #[test]
    fn test_client_error_classification() {
        assert!(EngineError::StepNotFound("x".to_string()).is_client_error());
        assert!(EngineError::AlreadyResumed("x".to_string()).is_client_error());
        assert!(!EngineError::LockTimeout("x".to_string()).is_client_error());
        assert!(!EngineError::Internal("x".to_string()).is_client_error());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::LockTimeout("x".to_string()).is_retryable());
        assert!(EngineError::NoWorkerAvailable.is_retryable());
        assert!(!EngineError::Validation(vec![]).is_retryable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let error: EngineError = json_error.into();
        assert!(matches!(error, EngineError::Serialization(_)));
    }
}
