//! Centralized configuration for the mirror cache.
//!
//! Compile-time defaults live on unit structs, the runtime [`ClientConfig`]
//! can be loaded from a JSON file and adjusted from the environment.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MirrorError, Result};

/// Cache-related defaults.
pub struct CacheDefaults;

impl CacheDefaults {
    /// How long an entry with no subscribers survives before it is evicted.
    pub const EVICTION_GRACE: Duration = Duration::from_secs(60);
    /// Capacity hint for the per-key snapshot map.
    pub const INITIAL_CAPACITY: usize = 64;
}

/// Network-related defaults.
pub struct NetworkDefaults;

impl NetworkDefaults {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    pub const USER_AGENT: &'static str = "mirror-cache/0.1";
}

/// Session / gate defaults.
pub struct SessionDefaults;

impl SessionDefaults {
    /// Where redirected consumers are sent when no session is available.
    pub const ENTRY_POINT: &'static str = "/login";
}

/// Environment variables consulted by [`ClientConfig::with_env_overrides`].
pub const ENV_BASE_URL: &str = "MIRROR_BASE_URL";
pub const ENV_EVICTION_GRACE_MS: &str = "MIRROR_EVICTION_GRACE_MS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "MIRROR_REQUEST_TIMEOUT_MS";

/// Runtime configuration for a [`MirrorClient`](crate::MirrorClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ClientConfig {
    /// Base URL the HTTP transport resolves request paths against.
    pub base_url: Option<String>,
    /// Transport timeout per request, in milliseconds.
    pub request_timeout_ms: u64,
    /// Default eviction grace period, in milliseconds.
    ///
    /// Endpoints may override it individually.
    pub eviction_grace_ms: u64,
    pub user_agent: String,
    /// Redirect target used by gates when the session is not authenticated.
    pub entry_point: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_ms: NetworkDefaults::REQUEST_TIMEOUT.as_millis() as u64,
            eviction_grace_ms: CacheDefaults::EVICTION_GRACE.as_millis() as u64,
            user_agent: NetworkDefaults::USER_AGENT.to_string(),
            entry_point: SessionDefaults::ENTRY_POINT.to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a JSON file. Missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| MirrorError::Io {
            message: format!("Failed to read config {}: {}", path.display(), e),
            source: Some(e),
        })?;
        let config: ClientConfig = serde_json::from_str(&raw)?;
        debug!("Loaded client config from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// Apply `MIRROR_*` environment variable overrides.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.base_url = Some(url);
        }
        if let Some(raw) = lookup(ENV_EVICTION_GRACE_MS) {
            self.eviction_grace_ms = parse_millis(ENV_EVICTION_GRACE_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            self.request_timeout_ms = parse_millis(ENV_REQUEST_TIMEOUT_MS, &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values that would make the client unusable.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(MirrorError::Config {
                message: "request_timeout_ms must be greater than zero".to_string(),
            });
        }
        if self.entry_point.is_empty() {
            return Err(MirrorError::Config {
                message: "entry_point must not be empty".to_string(),
            });
        }
        if let Some(base) = &self.base_url {
            url::Url::parse(base).map_err(|e| MirrorError::Config {
                message: format!("Invalid base_url {}: {}", base, e),
            })?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_eviction_grace(mut self, grace: Duration) -> Self {
        self.eviction_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }
}

fn parse_millis(name: &str, raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|e| MirrorError::Config {
        message: format!("{} must be an integer number of milliseconds: {}", name, e),
    })
}
