//! Orchestrator settings
//!
//! Loaded from JSON or assembled with the builder methods. Every field has a
//! default, so an empty JSON object is a valid config.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading an [`OrchestratorConfig`]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Bounded retry for credential acquisition.
///
/// The default of zero attempts means an exhausted pool fails the item at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRetry {
    /// Extra acquisition attempts after the first
    #[serde(default)]
    pub attempts: u32,
    /// Pause between attempts, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

impl CredentialRetry {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for CredentialRetry {
    fn default() -> Self {
        Self {
            attempts: 0,
            delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_max_concurrent() -> usize {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_broadcast_send_timeout_ms() -> u64 {
    5000
}

/// Settings for a [`crate::batch::BatchOrchestrator`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on items running at once within a batch
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-item limit on the runner call, in seconds. `None` waits indefinitely.
    #[serde(default)]
    pub job_timeout: Option<u64>,

    #[serde(default)]
    pub credential_retry: CredentialRetry,

    /// A subscriber that does not accept an update within this is dropped
    #[serde(default = "default_broadcast_send_timeout_ms")]
    pub broadcast_send_timeout_ms: u64,

    /// Headless flag used when batch options do not override it
    #[serde(default)]
    pub default_headless: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            job_timeout: None,
            credential_retry: CredentialRetry::default(),
            broadcast_send_timeout_ms: default_broadcast_send_timeout_ms(),
            default_headless: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency bound; values below 1 are raised to 1
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_credential_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.credential_retry = CredentialRetry {
            attempts,
            delay_ms: delay.as_millis() as u64,
        };
        self
    }

    pub fn with_broadcast_send_timeout(mut self, timeout: Duration) -> Self {
        self.broadcast_send_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_default_headless(mut self, headless: bool) -> Self {
        self.default_headless = headless;
        self
    }

    /// Load from a JSON file, normalizing out-of-range values
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validated()
    }

    /// Reject values that cannot be normalized and clamp the rest
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if self.broadcast_send_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "broadcast_send_timeout_ms must be positive".to_string(),
            ));
        }
        if self.job_timeout == Some(0) {
            return Err(ConfigError::Invalid(
                "job_timeout must be positive when set".to_string(),
            ));
        }
        self.max_concurrent = self.max_concurrent.max(1);
        Ok(self)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout.map(Duration::from_secs)
    }

    pub fn broadcast_send_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_send_timeout_ms)
    }
}
