//! Configuration parsing and management.
//!
//! The configuration is read from TOML. Durations use `humantime` syntax
//! (`"10m"`, `"1h"`). Every section has defaults, so an empty file is a valid
//! configuration that keeps its stores under `/var/lib/idmap`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sid::Sid;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the file.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantic validation failure.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdmapConfig {
    /// SID prefix of this machine, used to synthesize local identities.
    #[serde(default)]
    pub machine_sid: Option<String>,

    /// Domain assumed for windows names given without one.
    #[serde(default)]
    pub mapping_domain: Option<String>,

    /// Persistent store locations and contention policy.
    #[serde(default)]
    pub stores: StoresConfig,

    /// Cache expiry.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Ephemeral id allocation.
    #[serde(default)]
    pub ephemeral: EphemeralConfig,

    /// Directory lookups.
    #[serde(default)]
    pub directory: DirectoryConfig,
}

impl IdmapConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or its contents are invalid.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML does not parse or fails [`Self::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(machine_sid) = &self.machine_sid {
            // The machine prefix is a full SID on its own (S-1-5-21-a-b-c).
            machine_sid.parse::<Sid>().map_err(|e| {
                ConfigError::Validation(format!("machine_sid '{machine_sid}': {e}"))
            })?;
        }
        if matches!(&self.mapping_domain, Some(d) if d.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "mapping_domain must not be empty when set".to_string(),
            ));
        }
        if self.ephemeral.block_size == 0 {
            return Err(ConfigError::Validation(
                "ephemeral.block_size must be positive".to_string(),
            ));
        }
        self.stores.rules_busy.validate("stores.rules_busy")?;
        self.stores.cache_busy.validate("stores.cache_busy")?;
        Ok(())
    }
}

/// Store file locations and busy-retry schedules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoresConfig {
    /// Name-rule store.
    #[serde(default = "default_rules_path")]
    pub rules_path: PathBuf,

    /// Mapping and name cache store.
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    /// Contention policy for the rules store.
    #[serde(default = "BusyPolicy::rules_default")]
    pub rules_busy: BusyPolicy,

    /// Contention policy for the cache store.
    #[serde(default = "BusyPolicy::cache_default")]
    pub cache_busy: BusyPolicy,
}

fn default_rules_path() -> PathBuf {
    PathBuf::from("/var/lib/idmap/idmap.db")
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("/var/lib/idmap/idmap_cache.db")
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            rules_path: default_rules_path(),
            cache_path: default_cache_path(),
            rules_busy: BusyPolicy::rules_default(),
            cache_busy: BusyPolicy::cache_default(),
        }
    }
}

/// Busy-retry policy for one store.
///
/// Attempt `n` (1-based) sleeps `delays_ms[n - 1]`, or the last entry once the
/// schedule is exhausted. A warning is logged when the accumulated wait passes
/// `warn_after`; the threshold then grows by one second per warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusyPolicy {
    /// Ascending delay schedule in milliseconds.
    pub delays_ms: Vec<u64>,

    /// Accumulated wait before the first warning.
    #[serde(default = "default_warn_after", with = "humantime_serde")]
    pub warn_after: Duration,

    /// Give up after this many busy attempts; `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

const fn default_warn_after() -> Duration {
    Duration::from_secs(2)
}

impl BusyPolicy {
    /// Schedule for the rules store.
    #[must_use]
    pub fn rules_default() -> Self {
        Self {
            delays_ms: vec![5, 10, 15, 20, 30, 40, 55, 70, 100],
            warn_after: default_warn_after(),
            max_attempts: None,
        }
    }

    /// Schedule for the cache store: longer and finer-grained.
    #[must_use]
    pub fn cache_default() -> Self {
        Self {
            delays_ms: vec![1, 2, 5, 10, 15, 20, 25, 30, 35, 40, 50, 50, 60, 70, 80, 90, 100],
            warn_after: default_warn_after(),
            max_attempts: None,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) - 1) as usize;
        let ms = self
            .delays_ms
            .get(idx)
            .or_else(|| self.delays_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.delays_ms.is_empty() {
            return Err(ConfigError::Validation(format!(
                "{section}.delays_ms must not be empty"
            )));
        }
        if self.delays_ms.windows(2).any(|w| w[0] > w[1]) {
            return Err(ConfigError::Validation(format!(
                "{section}.delays_ms must be ascending"
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::Validation(format!(
                "{section}.max_attempts must be positive when set"
            )));
        }
        Ok(())
    }
}

/// Cache entry lifetimes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Lifetime of identity mapping rows.
    #[serde(default = "default_mapping_ttl", with = "humantime_serde")]
    pub mapping_ttl: Duration,

    /// Lifetime of name cache rows.
    #[serde(default = "default_name_ttl", with = "humantime_serde")]
    pub name_ttl: Duration,
}

const fn default_mapping_ttl() -> Duration {
    Duration::from_secs(600)
}

const fn default_name_ttl() -> Duration {
    Duration::from_secs(3600)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mapping_ttl: default_mapping_ttl(),
            name_ttl: default_name_ttl(),
        }
    }
}

/// Ephemeral id allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EphemeralConfig {
    /// Ids requested from the identity authority per refill.
    #[serde(default = "default_block_size")]
    pub block_size: u32,
}

const fn default_block_size() -> u32 {
    8192
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
        }
    }
}

/// Directory lookup behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryConfig {
    /// Extra attempts after a transient batch failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

const fn default_max_retries() -> u32 {
    2
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}
