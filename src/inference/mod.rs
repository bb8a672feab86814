//! Inference gateway core.
//!
//! ```text
//!   query(prompt, deadline)
//!          │
//!          ▼
//! ┌──────────────────────┐   format    ┌─────────────────┐
//! │     ModelSession     │────────────▶│   ChatFormat    │
//! │  (FIFO single-flight │   invoke    ├─────────────────┤
//! │   gate + lifecycle)  │────────────▶│ ProcessInvoker  │──▶ child process
//! │                      │   decode    ├─────────────────┤
//! │                      │────────────▶│   sanitizer     │
//! └──────────────────────┘             └─────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use llmgate_core::config::GatewayConfig;
//! use llmgate_core::inference::ModelSession;
//! use std::time::Duration;
//!
//! let config = GatewayConfig::load("config/settings.toml".as_ref())?;
//! let session = ModelSession::from_config(&config);
//! session.start().await?;
//! let result = session.query_within("Hello", Duration::from_secs(25)).await?;
//! println!("{}", result.text);
//! session.stop();
//! ```

mod error;
mod response;
mod session;

pub use error::InferenceError;
pub use response::InferenceResult;
pub use session::{ModelSession, SessionState};
