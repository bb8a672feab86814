//! External model process invocation.
//!
//! Each query spawns one short-lived child with `tokio::process::Command`,
//! collects both output streams fully and waits for exit. On deadline expiry
//! the child gets SIGTERM, a bounded grace period, then SIGKILL.
//! `.kill_on_drop(true)` covers callers that are cancelled mid-wait.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ModelParameters;
use crate::inference::InferenceError;

/// Everything needed to run the executable once.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub executable: &'a Path,
    pub model_path: &'a Path,
    pub prompt: &'a str,
    pub params: &'a ModelParameters,
}

/// Fully collected output of a finished process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// How an invocation ended. Partial output of a timed-out run is discarded.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Completed(ProcessOutput),
    TimedOut,
}

/// Runs the external model executable.
///
/// Implementations must not outlive `deadline`: when it passes they stop the
/// work they started and return [`InvocationOutcome::TimedOut`].
#[async_trait]
pub trait ProcessInvoker: Send + Sync {
    async fn invoke(
        &self,
        invocation: Invocation<'_>,
        deadline: Instant,
    ) -> Result<InvocationOutcome, InferenceError>;
}

/// Fail fast when the executable or model artifact is absent.
pub async fn check_artifacts(executable: &Path, model_path: &Path) -> Result<(), InferenceError> {
    if !is_file(executable).await {
        return Err(InferenceError::ExecutableMissing {
            path: executable.to_path_buf(),
        });
    }
    if !is_file(model_path).await {
        return Err(InferenceError::ModelArtifactMissing {
            path: model_path.to_path_buf(),
        });
    }
    Ok(())
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Command-line arguments for a llama.cpp style executable.
pub fn command_args(params: &ModelParameters, model_path: &Path, prompt: &str) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--model".into(),
        model_path.as_os_str().to_owned(),
        "--temp".into(),
        params.temperature.to_string().into(),
        "--ctx-size".into(),
        params.ctx_size.to_string().into(),
        "--threads".into(),
        params.threads.to_string().into(),
        "--batch-size".into(),
        params.batch_size.to_string().into(),
        "--top-k".into(),
        params.top_k.to_string().into(),
        "--top-p".into(),
        params.top_p.to_string().into(),
        "--repeat-penalty".into(),
        params.repeat_penalty.to_string().into(),
        "-n".into(),
        params.max_tokens.to_string().into(),
    ];
    if let Some(seed) = params.seed {
        args.push("--seed".into());
        args.push(seed.to_string().into());
    }
    if params.escape {
        args.push("-e".into());
    }
    args.push("-p".into());
    args.push(prompt.into());
    args
}

/// Invoker that spawns the configured executable as a child process.
#[derive(Debug, Clone)]
pub struct LlamaCliInvoker {
    termination_grace: Duration,
}

impl LlamaCliInvoker {
    pub fn new(termination_grace: Duration) -> Self {
        Self { termination_grace }
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    async fn terminate(&self, child: &mut Child) {
        let pid = child.id();

        #[cfg(unix)]
        {
            match pid.and_then(|p| i32::try_from(p).ok()).filter(|&p| p > 0) {
                Some(raw) => {
                    let nix_pid = nix::unistd::Pid::from_raw(raw);
                    if let Err(e) =
                        nix::sys::signal::kill(nix_pid, nix::sys::signal::Signal::SIGTERM)
                    {
                        if e != nix::errno::Errno::ESRCH {
                            warn!(pid = raw, error = %e, "Failed to send SIGTERM");
                        }
                    }
                }
                None => {
                    let _ = child.start_kill();
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "Failed to send kill signal");
            }
        }

        match tokio::time::timeout(self.termination_grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = ?pid, status = ?status, "Model process terminated");
            }
            Ok(Err(e)) => {
                warn!(pid = ?pid, error = %e, "Error waiting for terminated process");
            }
            Err(_) => {
                warn!(pid = ?pid, "Process ignored SIGTERM, killing");
                if let Err(e) = child.kill().await {
                    warn!(pid = ?pid, error = %e, "Failed to kill model process");
                }
            }
        }
    }
}

#[async_trait]
impl ProcessInvoker for LlamaCliInvoker {
    async fn invoke(
        &self,
        invocation: Invocation<'_>,
        deadline: Instant,
    ) -> Result<InvocationOutcome, InferenceError> {
        check_artifacts(invocation.executable, invocation.model_path).await?;

        let mut cmd = Command::new(invocation.executable);
        cmd.args(command_args(
            invocation.params,
            invocation.model_path,
            invocation.prompt,
        ))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => InferenceError::ExecutableMissing {
                path: invocation.executable.to_path_buf(),
            },
            _ => InferenceError::unexpected(format!(
                "failed to spawn {}: {}",
                invocation.executable.display(),
                e
            )),
        })?;

        let pid = child.id();
        debug!(
            pid = ?pid,
            executable = %invocation.executable.display(),
            prompt_len = invocation.prompt.len(),
            "Spawned model process"
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collected = tokio::time::timeout_at(deadline, async {
            tokio::try_join!(child.wait(), read_pipe(stdout), read_pipe(stderr))
        })
        .await;

        match collected {
            Ok(Ok((status, stdout, stderr))) => {
                debug!(
                    pid = ?pid,
                    status = ?status,
                    stdout_len = stdout.len(),
                    "Model process exited"
                );
                Ok(InvocationOutcome::Completed(ProcessOutput {
                    stdout,
                    stderr,
                    exit_code: status.code(),
                }))
            }
            Ok(Err(e)) => {
                self.terminate(&mut child).await;
                Err(InferenceError::unexpected(format!(
                    "failed to collect model process output: {e}"
                )))
            }
            Err(_) => {
                warn!(pid = ?pid, "Deadline expired, terminating model process");
                self.terminate(&mut child).await;
                Ok(InvocationOutcome::TimedOut)
            }
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}
