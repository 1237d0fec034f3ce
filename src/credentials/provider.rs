//! Provider configuration and the credentials handed out by the pool.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::CredentialError;

/// Environment variable consulted for the built-in default provider
pub const DEFAULT_API_KEY_ENV: &str = "DEEPSEEK_API_KEY";

/// Supported LLM providers.
///
/// Deserialization rejects unknown kinds, so adding one is a compile-time change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    DeepSeek,
    OpenAi,
}

impl ProviderKind {
    /// Endpoint used when a provider does not configure one
    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
            ProviderKind::OpenAi => "https://api.openai.com/v1",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::OpenAi => "openai",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_temperature() -> f32 {
    0.7
}

fn default_rate_limit() -> u32 {
    2
}

fn default_active() -> bool {
    true
}

/// One configured provider with its ordered keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub provider_name: String,
    #[serde(rename = "model_type")]
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Maximum acquisitions per key within a one-second window
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl ProviderConfig {
    /// Minimal active provider, mostly useful in tests and demos
    pub fn new(
        provider_id: impl Into<String>,
        kind: ProviderKind,
        api_keys: Vec<String>,
        rate_limit: u32,
    ) -> Self {
        let provider_id = provider_id.into();
        Self {
            provider_name: provider_id.clone(),
            provider_id,
            kind,
            base_url: None,
            model: match kind {
                ProviderKind::DeepSeek => "deepseek-chat".to_string(),
                ProviderKind::OpenAi => "gpt-4o".to_string(),
            },
            temperature: default_temperature(),
            max_tokens: None,
            api_keys,
            rate_limit,
            is_active: true,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Durable provider configuration.
///
/// Holds no rotation or rate-window state; those live only inside the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub providers: Vec<ProviderConfig>,
}

impl PoolConfig {
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self { providers }
    }

    /// Built-in fallback: one DeepSeek provider keyed from the environment
    pub fn default_from_env() -> Self {
        let key = std::env::var(DEFAULT_API_KEY_ENV).unwrap_or_default();
        let mut provider = ProviderConfig::new(
            "deepseek_default",
            ProviderKind::DeepSeek,
            vec![key],
            default_rate_limit(),
        );
        provider.provider_name = "DeepSeek default".to_string();
        provider.base_url = Some(ProviderKind::DeepSeek.default_base_url().to_string());
        Self::new(vec![provider])
    }

    /// Read a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let raw = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Read a JSON config file, falling back to [`PoolConfig::default_from_env`]
    /// when it is missing or unreadable
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No provider config found, using default provider");
            return Self::default_from_env();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to load provider config, using default provider"
                );
                Self::default_from_env()
            }
        }
    }

    /// Write the config as pretty JSON, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CredentialError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Providers that take part in rotation
    pub fn active_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|provider| provider.is_active)
    }

    /// Check the config before it is put in service
    pub fn validate(&self) -> Result<(), CredentialError> {
        if self.providers.is_empty() {
            return Err(CredentialError::InvalidConfig(
                "at least one provider is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.provider_id.trim().is_empty() {
                return Err(CredentialError::InvalidConfig(
                    "provider_id must not be empty".to_string(),
                ));
            }
            if provider.provider_name.trim().is_empty() {
                return Err(CredentialError::InvalidConfig(format!(
                    "provider {} has an empty provider_name",
                    provider.provider_id
                )));
            }
            if !seen.insert(provider.provider_id.as_str()) {
                return Err(CredentialError::InvalidConfig(format!(
                    "duplicate provider_id {}",
                    provider.provider_id
                )));
            }
            if provider.is_active && provider.api_keys.is_empty() {
                return Err(CredentialError::InvalidConfig(format!(
                    "active provider {} has no api keys",
                    provider.provider_id
                )));
            }
            if provider.is_active && provider.rate_limit == 0 {
                return Err(CredentialError::InvalidConfig(format!(
                    "active provider {} has a rate_limit of 0",
                    provider.provider_id
                )));
            }
        }

        if self.active_providers().next().is_none() {
            return Err(CredentialError::InvalidConfig(
                "at least one provider must be active".to_string(),
            ));
        }
        let usable_keys = self
            .active_providers()
            .flat_map(|provider| provider.api_keys.iter())
            .filter(|key| !key.trim().is_empty())
            .count();
        if usable_keys == 0 {
            return Err(CredentialError::InvalidConfig(
                "at least one non-empty api key is required".to_string(),
            ));
        }

        Ok(())
    }
}

/// A selected provider/key pair, ready to configure one external call
#[derive(Clone, PartialEq)]
pub struct Credential {
    pub provider_id: String,
    pub kind: ProviderKind,
    /// Position of the key within its provider's key list
    pub key_index: usize,
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Credential {
    pub(crate) fn from_provider(provider: &ProviderConfig, key_index: usize) -> Self {
        Self {
            provider_id: provider.provider_id.clone(),
            kind: provider.kind,
            key_index,
            api_key: provider.api_keys[key_index].clone(),
            base_url: provider.base_url.clone(),
            model: provider.model.clone(),
            temperature: provider.temperature,
            max_tokens: provider.max_tokens,
        }
    }

    /// Key prefix safe to log
    pub fn masked_key(&self) -> String {
        let prefix: String = self.api_key.chars().take(8).collect();
        format!("{prefix}...")
    }

    /// Build the typed client settings for this credential's provider kind
    pub fn client_settings(&self) -> ClientSettings {
        let endpoint = self
            .base_url
            .clone()
            .unwrap_or_else(|| self.kind.default_base_url().to_string());
        match self.kind {
            ProviderKind::DeepSeek => ClientSettings::DeepSeek {
                endpoint,
                model: self.model.clone(),
                api_key: self.api_key.clone(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            },
            // The OpenAI client takes no token cap
            ProviderKind::OpenAi => ClientSettings::OpenAi {
                endpoint,
                model: self.model.clone(),
                api_key: self.api_key.clone(),
                temperature: self.temperature,
            },
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("provider_id", &self.provider_id)
            .field("kind", &self.kind)
            .field("key_index", &self.key_index)
            .field("api_key", &self.masked_key())
            .field("model", &self.model)
            .finish()
    }
}

/// Client construction parameters, one variant per provider kind
#[derive(Debug, Clone, PartialEq)]
pub enum ClientSettings {
    DeepSeek {
        endpoint: String,
        model: String,
        api_key: String,
        temperature: f32,
        max_tokens: Option<u32>,
    },
    OpenAi {
        endpoint: String,
        model: String,
        api_key: String,
        temperature: f32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|key| key.to_string()).collect()
    }

    #[test]
    fn test_parse_config_file_field_names() {
        let raw = r#"{
            "providers": [{
                "provider_id": "ds",
                "provider_name": "DeepSeek",
                "model_type": "deepseek",
                "base_url": "https://example.test/v1",
                "model": "deepseek-chat",
                "api_keys": ["sk-aaaaaaaaaaaa", "sk-bbbbbbbbbbbb"],
                "rate_limit": 3,
                "is_active": true
            }]
        }"#;
        let config: PoolConfig = serde_json::from_str(raw).unwrap();
        let provider = &config.providers[0];
        assert_eq!(provider.kind, ProviderKind::DeepSeek);
        assert_eq!(provider.rate_limit, 3);
        assert_eq!(provider.temperature, 0.7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_provider_kind_is_rejected() {
        let raw = r#"{"providers": [{"provider_id": "x", "provider_name": "x",
            "model_type": "anthropic", "model": "m", "api_keys": ["k"]}]}"#;
        assert!(serde_json::from_str::<PoolConfig>(raw).is_err());
    }

    #[test]
    fn test_validation_rules() {
        assert!(PoolConfig::new(vec![]).validate().is_err());

        let inactive = PoolConfig::new(vec![
            ProviderConfig::new("a", ProviderKind::DeepSeek, keys(&["k"]), 1).inactive(),
        ]);
        assert!(inactive.validate().is_err());

        let no_keys = PoolConfig::new(vec![ProviderConfig::new(
            "a",
            ProviderKind::DeepSeek,
            vec![],
            1,
        )]);
        assert!(no_keys.validate().is_err());

        let blank_keys = PoolConfig::new(vec![ProviderConfig::new(
            "a",
            ProviderKind::DeepSeek,
            keys(&["", " "]),
            1,
        )]);
        assert!(blank_keys.validate().is_err());

        let duplicate = PoolConfig::new(vec![
            ProviderConfig::new("a", ProviderKind::DeepSeek, keys(&["k1"]), 1),
            ProviderConfig::new("a", ProviderKind::OpenAi, keys(&["k2"]), 1),
        ]);
        assert!(duplicate.validate().is_err());

        let zero_rate = PoolConfig::new(vec![ProviderConfig::new(
            "a",
            ProviderKind::DeepSeek,
            keys(&["k"]),
            0,
        )]);
        assert!(zero_rate.validate().is_err());

        // inactive providers may be incomplete
        let mixed = PoolConfig::new(vec![
            ProviderConfig::new("a", ProviderKind::DeepSeek, keys(&["k"]), 1),
            ProviderConfig::new("b", ProviderKind::OpenAi, vec![], 0).inactive(),
        ]);
        assert!(mixed.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("providers.json");
        let config = PoolConfig::new(vec![ProviderConfig::new(
            "a",
            ProviderKind::OpenAi,
            keys(&["k1", "k2"]),
            4,
        )]);
        config.save(&path).unwrap();
        assert_eq!(PoolConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_or_default_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let missing = PoolConfig::load_or_default(dir.path().join("absent.json"));
        assert_eq!(missing.providers[0].provider_id, "deepseek_default");

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();
        let fallback = PoolConfig::load_or_default(&broken);
        assert_eq!(fallback.providers[0].kind, ProviderKind::DeepSeek);
    }

    #[test]
    fn test_client_settings_factory() {
        let provider = ProviderConfig::new("o", ProviderKind::OpenAi, keys(&["sk-123456789"]), 1);
        let credential = Credential::from_provider(&provider, 0);
        match credential.client_settings() {
            ClientSettings::OpenAi { endpoint, api_key, .. } => {
                assert_eq!(endpoint, "https://api.openai.com/v1");
                assert_eq!(api_key, "sk-123456789");
            }
            other => panic!("unexpected settings {other:?}"),
        }

        let debug = format!("{credential:?}");
        assert!(debug.contains("sk-12345..."));
        assert!(!debug.contains("sk-123456789"));
    }
}
