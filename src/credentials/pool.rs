//! Round-robin credential selection with a per-key rate ceiling.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::provider::{Credential, PoolConfig, ProviderConfig, ProviderKind};
use super::CredentialError;
use crate::metrics;

/// Length of a key's rate window
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Fixed-window counter for one key
#[derive(Debug, Clone, Copy, Default)]
struct KeyWindow {
    count: u32,
    reset_at: Option<Instant>,
}

impl KeyWindow {
    fn is_expired(&self, now: Instant) -> bool {
        self.reset_at
            .map_or(true, |reset_at| now.saturating_duration_since(reset_at) >= RATE_WINDOW)
    }

    /// Requests counted in the window that is still open at `now`
    fn live_count(&self, now: Instant) -> u32 {
        if self.is_expired(now) {
            0
        } else {
            self.count
        }
    }
}

struct ProviderSlots {
    config: ProviderConfig,
    windows: Vec<KeyWindow>,
}

impl ProviderSlots {
    fn new(config: ProviderConfig) -> Self {
        let windows = vec![KeyWindow::default(); config.api_keys.len()];
        Self { config, windows }
    }

    fn key_is_usable(&self, key_index: usize) -> bool {
        !self.config.api_keys[key_index].trim().is_empty()
    }
}

/// Rotation pointers and rate windows. Runtime only; rebuilt from config.
struct PoolState {
    providers: Vec<ProviderSlots>,
    provider_cursor: usize,
    key_cursor: usize,
}

impl PoolState {
    fn from_config(config: &PoolConfig) -> Self {
        let providers = config
            .active_providers()
            .filter(|provider| !provider.api_keys.is_empty())
            .cloned()
            .map(ProviderSlots::new)
            .collect();
        Self {
            providers,
            provider_cursor: 0,
            key_cursor: 0,
        }
    }

    fn slot_count(&self) -> usize {
        self.providers.iter().map(|provider| provider.windows.len()).sum()
    }

    /// The slot after `(provider, key)`, wrapping to the next provider
    fn next_slot(&self, provider: usize, key: usize) -> (usize, usize) {
        if key + 1 < self.providers[provider].windows.len() {
            (provider, key + 1)
        } else {
            ((provider + 1) % self.providers.len(), 0)
        }
    }

    fn acquire(&mut self, now: Instant) -> Option<Credential> {
        let slots = self.slot_count();
        if slots == 0 {
            return None;
        }

        let mut provider = self.provider_cursor % self.providers.len();
        let mut key = self.key_cursor % self.providers[provider].windows.len();

        for _ in 0..slots {
            if self.providers[provider].key_is_usable(key) {
                let slot = &mut self.providers[provider];
                let rate_limit = slot.config.rate_limit;
                let window = &mut slot.windows[key];
                if window.is_expired(now) {
                    window.count = 0;
                    window.reset_at = Some(now);
                }
                if window.count < rate_limit {
                    window.count += 1;
                    let credential = Credential::from_provider(&slot.config, key);
                    let (next_provider, next_key) = self.next_slot(provider, key);
                    self.provider_cursor = next_provider;
                    self.key_cursor = next_key;
                    return Some(credential);
                }
            }
            (provider, key) = self.next_slot(provider, key);
        }

        None
    }
}

/// Per-provider line of a [`PoolStatus`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub provider_id: String,
    pub provider_name: String,
    pub kind: ProviderKind,
    pub api_key_count: usize,
    pub rate_limit: u32,
    /// Requests counted in currently open windows, summed over keys
    pub current_requests: u32,
    /// Whether some key could be handed out right now
    pub is_available: bool,
}

/// Snapshot of the pool's configuration and live counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatus {
    pub total_providers: usize,
    pub total_api_keys: usize,
    pub current_provider_index: usize,
    pub providers: Vec<ProviderStatus>,
}

/// Round-robin, rate-limited source of provider credentials.
///
/// Selection is serialized under one mutex; the external calls made with the
/// returned credentials are not. [`CredentialPool::acquire`] never waits.
pub struct CredentialPool {
    config: Mutex<PoolConfig>,
    state: Mutex<PoolState>,
}

impl CredentialPool {
    /// Build a pool from a validated config
    pub fn new(config: PoolConfig) -> Result<Self, CredentialError> {
        config.validate()?;
        let state = PoolState::from_config(&config);
        info!(
            providers = state.providers.len(),
            key_slots = state.slot_count(),
            "Credential pool ready"
        );
        Ok(Self {
            config: Mutex::new(config),
            state: Mutex::new(state),
        })
    }

    /// Take the next credential in rotation whose key still has budget in its
    /// current window. Returns `None` when every key is exhausted.
    pub fn acquire(&self) -> Option<Credential> {
        let credential = self.state.lock().acquire(Instant::now());
        match &credential {
            Some(credential) => {
                metrics::record_credential_acquisition(true);
                debug!(
                    provider_id = %credential.provider_id,
                    key_index = credential.key_index,
                    api_key = %credential.masked_key(),
                    "Acquired credential"
                );
            }
            None => {
                metrics::record_credential_acquisition(false);
                warn!("Credential pool exhausted");
            }
        }
        credential
    }

    /// Swap in a new provider set, resetting every counter and pointer.
    ///
    /// Persisting the config is left to the caller.
    pub fn replace_config(&self, config: PoolConfig) -> Result<PoolStatus, CredentialError> {
        config.validate()?;
        let fresh = PoolState::from_config(&config);
        {
            let mut state = self.state.lock();
            *state = fresh;
        }
        *self.config.lock() = config;
        info!("Credential pool configuration replaced");
        Ok(self.status())
    }

    /// Current durable configuration
    pub fn config(&self) -> PoolConfig {
        self.config.lock().clone()
    }

    /// Live view of providers, keys and window counters
    pub fn status(&self) -> PoolStatus {
        let now = Instant::now();
        let state = self.state.lock();
        let providers: Vec<ProviderStatus> = state
            .providers
            .iter()
            .map(|slot| {
                let is_available = slot.windows.iter().enumerate().any(|(key, window)| {
                    slot.key_is_usable(key) && window.live_count(now) < slot.config.rate_limit
                });
                ProviderStatus {
                    provider_id: slot.config.provider_id.clone(),
                    provider_name: slot.config.provider_name.clone(),
                    kind: slot.config.kind,
                    api_key_count: slot.config.api_keys.len(),
                    rate_limit: slot.config.rate_limit,
                    current_requests: slot.windows.iter().map(|w| w.live_count(now)).sum(),
                    is_available,
                }
            })
            .collect();

        PoolStatus {
            total_providers: providers.len(),
            total_api_keys: state.slot_count(),
            current_provider_index: state.provider_cursor,
            providers,
        }
    }
}
