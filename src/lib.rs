//! llmgate: an HTTP gateway in front of a command-line LLM executable.
//!
//! One [`ModelSession`] owns the right to invoke the model binary. Queries
//! are serialized through it, formatted with the configured chat template,
//! run as a child process under a deadline and cleaned before they are
//! returned to the caller.

pub mod config;
pub mod error;
pub mod inference;
pub mod runtime;
pub mod server;

pub use config::{GatewayConfig, ModelConfig, ModelParameters, ServerConfig};
pub use error::{GatewayError, Result};
pub use inference::{InferenceError, InferenceResult, ModelSession, SessionState};
pub use runtime::{ChatFormat, LlamaCliInvoker, ProcessInvoker, ResponseDecoder};
pub use server::state::ServerState;
