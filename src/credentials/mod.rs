//! Provider credentials shared by every concurrently running job.
//!
//! A [`CredentialPool`] rotates through the keys of all active providers and
//! caps how often each key is handed out per second. Selection is
//! non-blocking: when every key is spent the pool says so and the caller
//! decides whether to retry.

mod pool;
mod provider;

pub use pool::{CredentialPool, PoolStatus, ProviderStatus, RATE_WINDOW};
pub use provider::{
    ClientSettings, Credential, PoolConfig, ProviderConfig, ProviderKind, DEFAULT_API_KEY_ENV,
};

use thiserror::Error;

/// Errors raised while loading or applying provider configuration
#[derive(Error, Debug)]
pub enum CredentialError {
    /// The config failed validation
    #[error("Invalid provider configuration: {0}")]
    InvalidConfig(String),

    /// Reading or writing the config file failed
    #[error("Provider config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid JSON for this schema
    #[error("Provider config format error: {0}")]
    Serialization(#[from] serde_json::Error),
}
