//! Inference error type.
//!
//! Every failure a query can produce is one of these variants. The request
//! pipeline is the only place that turns them into HTTP responses.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Inference gateway error type.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    /// The model executable does not exist.
    #[error("Model executable not found: {}", path.display())]
    ExecutableMissing { path: PathBuf },

    /// The model weights file does not exist.
    #[error("Model artifact not found: {}", path.display())]
    ModelArtifactMissing { path: PathBuf },

    /// The system prompt file could not be read (startup only).
    #[error("System prompt unavailable at {}: {message}", path.display())]
    SystemPromptUnavailable { path: PathBuf, message: String },

    /// The external process exited unsuccessfully.
    #[error("Model process failed: {stderr_text}")]
    ProcessFailed {
        stderr_text: String,
        exit_code: Option<i32>,
    },

    /// The deadline expired before a result was available.
    #[error("Inference timed out after {:.2}s", elapsed.as_secs_f64())]
    Timeout { elapsed: Duration },

    /// Anything else: spawn failures, lifecycle misuse, I/O faults.
    #[error("Unexpected error: {message}")]
    Unexpected { message: String },
}

impl InferenceError {
    /// Whether this error belongs to the timeout class (HTTP 504).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Short stable label used in logs and error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecutableMissing { .. } => "executable_missing",
            Self::ModelArtifactMissing { .. } => "model_artifact_missing",
            Self::SystemPromptUnavailable { .. } => "system_prompt_unavailable",
            Self::ProcessFailed { .. } => "process_failed",
            Self::Timeout { .. } => "timeout",
            Self::Unexpected { .. } => "unexpected",
        }
    }

    /// Create an unexpected error.
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected {
            message: msg.into(),
        }
    }

    /// The error returned for queries against a session that is not running.
    pub fn not_initialized() -> Self {
        Self::unexpected("model session not initialized")
    }
}

impl From<std::io::Error> for InferenceError {
    fn from(e: std::io::Error) -> Self {
        Self::unexpected(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeout_is_timeout() {
        let err = InferenceError::Timeout {
            elapsed: Duration::from_secs(25),
        };
        assert!(err.is_timeout());
        assert_eq!(err.kind(), "timeout");

        let err = InferenceError::ProcessFailed {
            stderr_text: "bad model file".into(),
            exit_code: Some(1),
        };
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "Model process failed: bad model file");
    }

    #[test]
    fn test_not_initialized_is_unexpected() {
        let err = InferenceError::not_initialized();
        assert!(matches!(
            err,
            InferenceError::Unexpected { ref message } if message.contains("not initialized")
        ));
    }
}
