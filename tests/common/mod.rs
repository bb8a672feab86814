#![allow(dead_code)]

use async_trait::async_trait;
use llmgate_core::config::{
    DecodingConfig, GatewayConfig, ModelConfig, ModelParameters, ServerConfig,
};
use llmgate_core::runtime::{Invocation, InvocationOutcome, ProcessInvoker, ProcessOutput};
use llmgate_core::{ChatFormat, InferenceError, ModelSession};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

pub fn chat_format() -> ChatFormat {
    ChatFormat {
        system_prefix: "<|system|>\n".into(),
        system_suffix: "</s>\n".into(),
        user_prefix: "<|user|>\n".into(),
        user_suffix: "</s>\n".into(),
        assistant_prefix: "<|assistant|>\n".into(),
        assistant_suffix: "</s>".into(),
    }
}

pub fn model_params() -> ModelParameters {
    ModelParameters {
        temperature: 0.7,
        ctx_size: 2048,
        threads: 4,
        batch_size: 512,
        top_k: 40,
        top_p: 0.9,
        repeat_penalty: 1.1,
        max_tokens: 256,
        seed: None,
        escape: true,
    }
}

/// A temp directory holding an executable placeholder, a model file and a
/// system prompt, plus a config pointing at them.
pub struct Fixture {
    pub dir: TempDir,
    pub config: GatewayConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let executable = dir.path().join("llama-cli");
        let model = dir.path().join("model.gguf");
        let prompt = dir.path().join("system_prompt.txt");

        std::fs::write(&executable, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::write(&model, b"GGUF").unwrap();
        std::fs::write(&prompt, format!("{SYSTEM_PROMPT}\n")).unwrap();

        let config = GatewayConfig {
            server: ServerConfig::default(),
            model: ModelConfig {
                executable,
                path: model,
                system_prompt_file: prompt,
                termination_grace_ms: 200,
            },
            model_params: model_params(),
            chat_format: chat_format(),
            decoding: DecodingConfig::default(),
        };

        Self { dir, config }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Replace the executable with a shell script
    #[cfg(unix)]
    pub fn install_script(&self, body: &str) {
        use std::os::unix::fs::PermissionsExt;

        let path = &self.config.model.executable;
        std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    pub fn executable(&self) -> &Path {
        &self.config.model.executable
    }
}

/// What the stub process prints
#[derive(Debug, Clone)]
pub enum Reply {
    /// Echo the formatted prompt, then this continuation
    Echo(String),
    /// Exit non-zero with this stderr
    Fail { stderr: String, exit_code: i32 },
    /// Panic inside the invoker
    Panic,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub prompt: String,
    pub started: Instant,
    pub finished: Instant,
}

/// In-process stand-in for the model executable
pub struct StubInvoker {
    reply: Reply,
    delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<Call>>,
}

impl StubInvoker {
    pub fn new(reply: Reply, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply,
            delay_ms: AtomicU64::new(delay.as_millis() as u64),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn echo(text: &str) -> Arc<Self> {
        Self::new(Reply::Echo(text.to_string()), Duration::ZERO)
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessInvoker for StubInvoker {
    async fn invoke(
        &self,
        invocation: Invocation<'_>,
        deadline: Instant,
    ) -> Result<InvocationOutcome, InferenceError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let started = Instant::now();
        let delay = Duration::from_millis(self.delay_ms.load(Ordering::SeqCst));
        let finished_in_time = tokio::time::timeout_at(deadline, tokio::time::sleep(delay))
            .await
            .is_ok();

        self.calls.lock().push(Call {
            prompt: invocation.prompt.to_string(),
            started,
            finished: Instant::now(),
        });

        if !finished_in_time {
            return Ok(InvocationOutcome::TimedOut);
        }

        let output = match &self.reply {
            Reply::Echo(text) => ProcessOutput {
                stdout: format!("{}{}", invocation.prompt, text).into_bytes(),
                stderr: Vec::new(),
                exit_code: Some(0),
            },
            Reply::Fail { stderr, exit_code } => ProcessOutput {
                stdout: Vec::new(),
                stderr: stderr.clone().into_bytes(),
                exit_code: Some(*exit_code),
            },
            Reply::Panic => panic!("stub invoker exploded"),
        };
        Ok(InvocationOutcome::Completed(output))
    }
}

/// A started session backed by `invoker`
pub async fn started_session(fixture: &Fixture, invoker: Arc<StubInvoker>) -> Arc<ModelSession> {
    let session = Arc::new(ModelSession::new(&fixture.config, invoker));
    session.start().await.unwrap();
    session
}
