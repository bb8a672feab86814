//! Successful inference result.

use std::time::Duration;

/// Value returned by a successful query.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    /// Cleaned response text.
    pub text: String,
    /// Wall time spent inside the external process.
    pub model_duration: Duration,
    /// Wall time from query entry to return, including time queued on the gate.
    pub total_duration: Duration,
}
