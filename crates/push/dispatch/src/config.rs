//! Dispatch configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use push_provider::{DEFAULT_CONCURRENCY, ProviderConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for the provider cache and every provider it builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Age after which a cached provider is evicted. Unset means never.
    pub ttl_secs: Option<u64>,
    /// Period of the eviction sweep.
    #[serde(default = "default_check_period")]
    pub check_period_secs: u64,
    /// Bound on graceful shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Period between connection rotations. 0 disables rotation.
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_secs: u64,
    /// Period of the queue rate sampler. 0 disables it.
    #[serde(default = "default_rate_sample")]
    pub rate_sample_secs: u64,
    /// Queue concurrency for applications that do not set one.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_check_period() -> u64 {
    60
}

fn default_shutdown_timeout() -> u64 {
    crate::SHUTDOWN_TIMEOUT.as_secs()
}

fn default_rotation_interval() -> u64 {
    50 * 60
}

fn default_rate_sample() -> u64 {
    5
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ttl_secs: None,
            check_period_secs: default_check_period(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            rotation_interval_secs: default_rotation_interval(),
            rate_sample_secs: default_rate_sample(),
            concurrency: default_concurrency(),
        }
    }
}

fn nonzero(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl DispatchConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the cache and queues cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_period_secs == 0 {
            return Err(ConfigError::Invalid("check_period_secs must be positive".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be positive".into()));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.and_then(nonzero)
    }

    pub fn check_period(&self) -> Duration {
        Duration::from_secs(self.check_period_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Settings handed to every provider.
    pub fn provider(&self) -> ProviderConfig {
        ProviderConfig {
            concurrency: self.concurrency,
            rotation_interval: nonzero(self.rotation_interval_secs),
            rate_sample_interval: nonzero(self.rate_sample_secs),
            drain_timeout: self.shutdown_timeout(),
        }
    }
}
