//! Configuration system for llmgate
//!
//! Settings are layered with the `config` crate:
//! 1. Built-in defaults (`config/default.toml`, embedded in the binary)
//! 2. The settings file given on the command line (required)
//! 3. Environment variables such as `LLMGATE_SERVER__PORT` (`__` separates section and key)
//!
//! Later sources override earlier ones. `[model]`, `[model_params]` and
//! `[chat_format]` have no built-in defaults, so a settings file that omits
//! them fails to load.

pub mod server;

pub use server::{CorsConfig, ServerConfig, ServerConfigBuilder};

use crate::error::{GatewayError, Result};
use crate::runtime::template_engine::ChatFormat;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// Root configuration for the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// External executable and artifact locations
    pub model: ModelConfig,

    /// Generation parameters forwarded to the executable
    pub model_params: ModelParameters,

    /// Role delimiters used to build and clean prompts
    pub chat_format: ChatFormat,

    /// Output decoding settings
    #[serde(default)]
    pub decoding: DecodingConfig,
}

/// Locations of the external inference backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the inference executable
    pub executable: PathBuf,
    /// Path to the model weights file
    pub path: PathBuf,
    /// Plain-text file holding the system prompt
    pub system_prompt_file: PathBuf,
    /// How long a terminated process gets to exit before it is killed
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,
}

fn default_termination_grace_ms() -> u64 {
    2000
}

impl ModelConfig {
    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    /// Resolve relative paths against `base` (the settings file directory)
    pub fn resolve_relative_to(&mut self, base: &Path) {
        for path in [
            &mut self.executable,
            &mut self.path,
            &mut self.system_prompt_file,
        ] {
            if path.is_relative() && !path.as_os_str().is_empty() {
                *path = base.join(&*path);
            }
        }
    }
}

/// Text generation parameters
///
/// Every numeric parameter must be present in the settings file; unknown
/// keys are rejected so a misspelled parameter cannot fall back silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelParameters {
    /// Sampling temperature
    pub temperature: f32,
    /// Context window size
    pub ctx_size: u32,
    /// CPU threads used by the executable
    pub threads: usize,
    /// Prompt processing batch size
    pub batch_size: u32,
    /// Top-k sampling limit
    pub top_k: u32,
    /// Nucleus sampling threshold
    pub top_p: f32,
    /// Repetition penalty
    pub repeat_penalty: f32,
    /// Maximum tokens to generate
    #[serde(alias = "n_predict")]
    pub max_tokens: u32,
    /// Random seed for reproducible generation
    #[serde(default)]
    pub seed: Option<i64>,
    /// Ask the executable to process escape sequences in the prompt
    #[serde(default = "default_escape")]
    pub escape: bool,
}

fn default_escape() -> bool {
    true
}

impl ModelParameters {
    /// Check numeric ranges
    pub fn validate(&self) -> Result<()> {
        if self.temperature.is_nan() || self.temperature < 0.0 {
            return Err(invalid("model_params.temperature must be >= 0"));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(invalid("model_params.top_p must be within [0, 1]"));
        }
        if self.repeat_penalty.is_nan() || self.repeat_penalty <= 0.0 {
            return Err(invalid("model_params.repeat_penalty must be > 0"));
        }
        if self.ctx_size == 0 || self.batch_size == 0 || self.threads == 0 {
            return Err(invalid(
                "model_params.ctx_size, batch_size and threads must be > 0",
            ));
        }
        if self.max_tokens == 0 {
            return Err(invalid("model_params.max_tokens must be > 0"));
        }
        Ok(())
    }
}

/// Output decoding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodingConfig {
    /// Minimum detector confidence before a non-UTF-8 decoding is trusted
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

fn default_confidence_threshold() -> f32 {
    0.5
}

impl Default for DecodingConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the embedded defaults, `path` and the environment.
    ///
    /// The settings file is mandatory. Relative model paths are resolved
    /// against the directory containing it. The result is validated.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(GatewayError::Config(format!(
                "settings file not found: {}",
                path.display()
            )));
        }

        let settings = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(File::from(path).required(true))
            .add_source(
                Environment::with_prefix("LLMGATE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let mut config: GatewayConfig = settings.try_deserialize()?;

        if let Some(base) = path.parent() {
            config.model.resolve_relative_to(base);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        self.model_params.validate()?;

        if !(0.0..=1.0).contains(&self.decoding.confidence_threshold) {
            return Err(invalid("decoding.confidence_threshold must be within [0, 1]"));
        }

        if self.server.request_timeout_secs == 0 || self.server.inference_timeout_secs == 0 {
            return Err(invalid("server timeouts must be > 0"));
        }
        if self.server.inference_timeout_secs >= self.server.request_timeout_secs {
            return Err(invalid(
                "server.inference_timeout_secs must be shorter than server.request_timeout_secs",
            ));
        }

        for (name, path) in [
            ("model.executable", &self.model.executable),
            ("model.path", &self.model.path),
            ("model.system_prompt_file", &self.model.system_prompt_file),
        ] {
            if path.as_os_str().is_empty() {
                return Err(invalid(&format!("{name} must be set")));
            }
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> GatewayError {
    GatewayError::Config(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SETTINGS: &str = r#"
[model]
executable = "bin/llama"
path = "models/tiny.gguf"
system_prompt_file = "/etc/llmgate/system.txt"

[model_params]
temperature = 0.2
ctx_size = 1024
threads = 2
batch_size = 64
top_k = 20
top_p = 0.8
repeat_penalty = 1.05
n_predict = 128
seed = 42

[chat_format]
system_prefix = "<|system|>"
user_prefix = "<|user|>"
assistant_prefix = "<|assistant|>"
"#;

    fn write_settings(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("settings.toml");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_settings_file() {
        let dir = TempDir::new().unwrap();
        let path = write_settings(&dir, SETTINGS);

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.model_params.max_tokens, 128);
        assert_eq!(config.model_params.seed, Some(42));
        assert!(config.model_params.escape);
        assert_eq!(config.chat_format.user_prefix, "<|user|>");
        assert_eq!(config.chat_format.assistant_suffix, "");
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.decoding.confidence_threshold, 0.5);

        // Relative paths land next to the settings file, absolute ones are kept
        assert_eq!(config.model.executable, dir.path().join("bin/llama"));
        assert_eq!(config.model.path, dir.path().join("models/tiny.gguf"));
        assert_eq!(
            config.model.system_prompt_file,
            PathBuf::from("/etc/llmgate/system.txt")
        );
        assert_eq!(config.model.termination_grace(), Duration::from_millis(2000));
    }

    #[test]
    fn test_missing_settings_file_fails() {
        let dir = TempDir::new().unwrap();
        let err = GatewayConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, GatewayError::Config(msg) if msg.contains("not found")));
    }

    #[test]
    fn test_missing_section_fails() {
        let dir = TempDir::new().unwrap();
        let without_format = SETTINGS.split("[chat_format]").next().unwrap();
        let path = write_settings(&dir, without_format);

        assert!(matches!(
            GatewayConfig::load(&path),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_negative_temperature_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_settings(
            &dir,
            &SETTINGS.replace("temperature = 0.2", "temperature = -1.0"),
        );

        let err = GatewayConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn test_inference_timeout_must_fit_request_timeout() {
        let dir = TempDir::new().unwrap();
        let contents = format!(
            "[server]\nrequest_timeout_secs = 10\ninference_timeout_secs = 10\n{SETTINGS}"
        );
        let path = write_settings(&dir, &contents);

        let err = GatewayConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("inference_timeout_secs"));
    }

    #[test]
    fn test_misspelled_parameter_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_settings(
            &dir,
            &SETTINGS.replace("temperature = 0.2", "temprature = 0.1"),
        );

        let err = GatewayConfig::load(&path).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
        assert!(err.to_string().contains("temprature"));
    }

    #[test]
    fn test_partial_parameters_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_settings(&dir, &SETTINGS.replace("ctx_size = 1024\n", ""));

        let err = GatewayConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("ctx_size"));
    }

    #[test]
    fn test_optional_parameters_default() {
        let dir = TempDir::new().unwrap();
        let path = write_settings(&dir, &SETTINGS.replace("seed = 42\n", ""));

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.model_params.seed, None);
        assert!(config.model_params.escape);
    }
}
