//! Model session: the single authority over the external model process.
//!
//! A session owns the *right* to invoke the executable, not a long-lived
//! process handle. Every query formats the prompt, runs one child process
//! under the caller's deadline and sanitizes its output. A FIFO gate keeps
//! at most one child in flight.
//!
//! ```text
//!  Uninitialized ──start()──▶ Ready ◀──────┐
//!                              │ query()   │ done / failed / cancelled
//!                              ▼           │
//!                             Busy ────────┘
//!  Ready | Busy ──stop()──▶ Stopped
//! ```

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{GatewayConfig, ModelParameters};
use crate::runtime::{
    check_artifacts, clean, ChatFormat, Invocation, InvocationOutcome, LlamaCliInvoker,
    ProcessInvoker, ResponseDecoder,
};

use super::error::InferenceError;
use super::response::InferenceResult;

/// Lifecycle state of a [`ModelSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
    Busy,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Stopped => "stopped",
        }
    }

    /// Whether queries are accepted in this state.
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binding between the gateway and its external model executable.
pub struct ModelSession {
    executable: PathBuf,
    model_path: PathBuf,
    system_prompt_file: PathBuf,
    params: ModelParameters,
    chat_format: ChatFormat,
    decoder: ResponseDecoder,
    invoker: Arc<dyn ProcessInvoker>,
    system_prompt: RwLock<Option<Arc<str>>>,
    state: Mutex<SessionState>,
    /// Single-flight gate; tokio's mutex queues waiters in FIFO order.
    gate: tokio::sync::Mutex<()>,
}

impl ModelSession {
    /// Create a session that invokes processes through `invoker`.
    pub fn new(config: &GatewayConfig, invoker: Arc<dyn ProcessInvoker>) -> Self {
        Self {
            executable: config.model.executable.clone(),
            model_path: config.model.path.clone(),
            system_prompt_file: config.model.system_prompt_file.clone(),
            params: config.model_params.clone(),
            chat_format: config.chat_format.clone(),
            decoder: ResponseDecoder::new(config.decoding.confidence_threshold),
            invoker,
            system_prompt: RwLock::new(None),
            state: Mutex::new(SessionState::Uninitialized),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a session backed by the real executable.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let invoker = LlamaCliInvoker::new(config.model.termination_grace());
        Self::new(config, Arc::new(invoker))
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// The loaded system prompt, if the session has been started.
    pub fn system_prompt(&self) -> Option<Arc<str>> {
        self.system_prompt.read().clone()
    }

    /// Validate the backend and load the system prompt.
    ///
    /// Calling `start` on a running session is a no-op; a stopped session
    /// cannot be restarted.
    #[instrument(skip_all, fields(executable = %self.executable.display()))]
    pub async fn start(&self) -> Result<(), InferenceError> {
        match self.state() {
            SessionState::Ready | SessionState::Busy => return Ok(()),
            SessionState::Stopped => {
                return Err(InferenceError::unexpected("model session already stopped"))
            }
            SessionState::Uninitialized => {}
        }

        check_artifacts(&self.executable, &self.model_path).await?;

        let text = tokio::fs::read_to_string(&self.system_prompt_file)
            .await
            .map_err(|e| InferenceError::SystemPromptUnavailable {
                path: self.system_prompt_file.clone(),
                message: e.to_string(),
            })?;
        let prompt: Arc<str> = Arc::from(text.trim());

        *self.system_prompt.write() = Some(prompt.clone());
        {
            let mut state = self.state.lock();
            if *state == SessionState::Uninitialized {
                *state = SessionState::Ready;
            }
        }

        info!(
            model = %self.model_path.display(),
            system_prompt_len = prompt.len(),
            "Model session ready"
        );
        Ok(())
    }

    /// Stop accepting queries. Idempotent.
    ///
    /// A query already running finishes normally; queued ones fail with a
    /// "not initialized" error once they reach the gate.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), SessionState::Stopped);
        *self.system_prompt.write() = None;
        if previous != SessionState::Stopped {
            info!(previous = %previous, "Model session stopped");
        }
    }

    /// Run one inference with `budget` counted from now.
    pub async fn query_within(
        &self,
        prompt: &str,
        budget: Duration,
    ) -> Result<InferenceResult, InferenceError> {
        self.query(prompt, Instant::now() + budget).await
    }

    /// Run one inference that must finish before `deadline`.
    ///
    /// Waiting for the gate counts against the deadline. The first failure is
    /// returned as is; nothing is retried.
    #[instrument(skip_all, fields(prompt_len = prompt.len()))]
    pub async fn query(
        &self,
        prompt: &str,
        deadline: Instant,
    ) -> Result<InferenceResult, InferenceError> {
        let started = Instant::now();

        if !self.state().is_serving() {
            return Err(InferenceError::not_initialized());
        }

        let _permit = match tokio::time::timeout_at(deadline, self.gate.lock()).await {
            Ok(permit) => permit,
            Err(_) => {
                let elapsed = started.elapsed();
                warn!(
                    waited_ms = elapsed.as_millis() as u64,
                    "Deadline expired while queued for the model"
                );
                return Err(InferenceError::Timeout { elapsed });
            }
        };
        // The gate may be granted at or after the deadline
        if Instant::now() >= deadline {
            let elapsed = started.elapsed();
            warn!(
                waited_ms = elapsed.as_millis() as u64,
                "Deadline expired on acquiring the model gate"
            );
            return Err(InferenceError::Timeout { elapsed });
        }
        let _busy = BusyGuard::enter(&self.state)?;
        let system_prompt = self
            .system_prompt()
            .ok_or_else(InferenceError::not_initialized)?;

        debug!(queued_ms = started.elapsed().as_millis() as u64, "Acquired model gate");

        let formatted = self.chat_format.format(&system_prompt, prompt);
        let invocation = Invocation {
            executable: &self.executable,
            model_path: &self.model_path,
            prompt: &formatted,
            params: &self.params,
        };

        let model_started = Instant::now();
        let outcome = self.invoker.invoke(invocation, deadline).await?;
        let model_duration = model_started.elapsed();

        let output = match outcome {
            InvocationOutcome::Completed(output) => output,
            InvocationOutcome::TimedOut => {
                let elapsed = started.elapsed();
                warn!(elapsed_ms = elapsed.as_millis() as u64, "Model process timed out");
                return Err(InferenceError::Timeout { elapsed });
            }
        };

        if !output.success() {
            let stderr_text = self.decoder.decode(&output.stderr).trim().to_string();
            error!(exit_code = ?output.exit_code, stderr = %stderr_text, "Model process failed");
            return Err(InferenceError::ProcessFailed {
                stderr_text,
                exit_code: output.exit_code,
            });
        }

        let raw = self.decoder.decode(&output.stdout);
        let text = clean(&raw, &self.chat_format, &system_prompt);
        let total_duration = started.elapsed();

        info!(
            model_ms = model_duration.as_millis() as u64,
            total_ms = total_duration.as_millis() as u64,
            response_len = text.len(),
            "Inference completed"
        );

        Ok(InferenceResult {
            text,
            model_duration,
            total_duration,
        })
    }
}

impl fmt::Debug for ModelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSession")
            .field("executable", &self.executable)
            .field("model_path", &self.model_path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Marks the session Busy while a query holds the gate.
///
/// Restores Ready on drop, including when the query future is cancelled,
/// unless the session was stopped in the meantime.
struct BusyGuard<'a> {
    state: &'a Mutex<SessionState>,
}

impl<'a> BusyGuard<'a> {
    fn enter(state: &'a Mutex<SessionState>) -> Result<Self, InferenceError> {
        let mut current = state.lock();
        match *current {
            SessionState::Ready | SessionState::Busy => {
                *current = SessionState::Busy;
                Ok(Self { state })
            }
            _ => Err(InferenceError::not_initialized()),
        }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut current = self.state.lock();
        if *current == SessionState::Busy {
            *current = SessionState::Ready;
        }
    }
}
