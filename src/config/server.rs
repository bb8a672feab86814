//! Server configuration with builder pattern
//!
//! Network settings, the two request deadlines and the optional CORS layer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// CORS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Enable CORS middleware
    #[serde(default)]
    pub enabled: bool,

    /// Allowed origins (use ["*"] for all origins)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Wall-clock budget for a whole HTTP request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Budget handed to the model session; must be shorter than the request budget
    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    #[serde(default)]
    pub cors: CorsConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_inference_timeout_secs() -> u64 {
    25
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            inference_timeout_secs: default_inference_timeout_secs(),
            cors: CorsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a builder for this config
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Create a builder from existing config
    pub fn to_builder(self) -> ServerConfigBuilder {
        ServerConfigBuilder::from_config(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    /// `host:port` string suitable for parsing into a socket address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Builder for ServerConfig with chainable methods
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Start from an existing config
    pub fn from_config(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_secs = timeout.as_secs();
        self
    }

    pub fn inference_timeout(mut self, timeout: Duration) -> Self {
        self.config.inference_timeout_secs = timeout.as_secs();
        self
    }

    /// Load values from environment variables (merges with current config)
    pub fn from_env(mut self) -> Self {
        if let Ok(host) = std::env::var("LLMGATE_SERVER_HOST") {
            self.config.host = host;
        }
        if let Ok(port) = std::env::var("LLMGATE_SERVER_PORT") {
            if let Ok(p) = port.parse() {
                self.config.port = p;
            }
        }

        if let Ok(timeout) = std::env::var("LLMGATE_REQUEST_TIMEOUT_SECS") {
            if let Ok(t) = timeout.parse() {
                self.config.request_timeout_secs = t;
            }
        }
        if let Ok(timeout) = std::env::var("LLMGATE_INFERENCE_TIMEOUT_SECS") {
            if let Ok(t) = timeout.parse() {
                self.config.inference_timeout_secs = t;
            }
        }

        if let Ok(cors_enabled) = std::env::var("LLMGATE_CORS_ENABLED") {
            self.config.cors.enabled = cors_enabled.to_lowercase() != "false";
        }
        if let Ok(cors_origins) = std::env::var("LLMGATE_CORS_ORIGINS") {
            self.config.cors.allowed_origins = cors_origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        self
    }

    /// Build the final configuration
    pub fn build(self) -> ServerConfig {
        self.config
    }
}
