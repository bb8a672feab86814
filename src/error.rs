//! Error types for the llmgate service.

use crate::inference::InferenceError;
use thiserror::Error;

/// A specialized Result type for gateway startup and configuration.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that prevent the gateway from starting or serving.
///
/// Per-request failures are reported through [`InferenceError`]; this type
/// only covers what happens before the first request is accepted.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration is missing, malformed or out of range
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The model session could not be brought up
    #[error("Startup failed: {0}")]
    Startup(#[source] InferenceError),
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::Config(err.to_string())
    }
}

impl From<InferenceError> for GatewayError {
    fn from(err: InferenceError) -> Self {
        GatewayError::Startup(err)
    }
}
