use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{Capability, CompositionRule};
use crate::orchestration::retry::RetryPolicy;
use crate::{Error, Result};

/// Default per-attempt deadline.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default simultaneous invocations per capability.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default buffer of the progress event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default number of delivered responses kept for late lookups.
pub const DEFAULT_RETAINED_RESPONSES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub default_timeout_secs: u64,
    pub default_concurrency: usize,
    pub event_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            default_concurrency: DEFAULT_CONCURRENCY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Per-capability overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityConfig {
    pub concurrency: Option<usize>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How results of a fully successful request are combined.
    pub composition: CompositionRule,
    /// Capability for requests no rule recognizes. Empty disables the
    /// fallback.
    pub default_capability: String,
    /// Drop a request's graph once its response has been produced.
    pub archive_terminal: bool,
    /// Delivered requests kept for `aggregate`/`wait_for`; the oldest are
    /// dropped beyond this.
    pub retain_responses: usize,
    pub retry: RetryPolicy,
    pub dispatch: DispatchConfig,
    pub capabilities: BTreeMap<String, CapabilityConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            composition: CompositionRule::default(),
            default_capability: crate::core::capabilities::LLM.to_string(),
            archive_terminal: true,
            retain_responses: DEFAULT_RETAINED_RESPONSES,
            retry: RetryPolicy::default(),
            dispatch: DispatchConfig::default(),
            capabilities: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn switchboard_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(".switchboard"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::switchboard_dir()?.join("switchboard.toml"))
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!("Config::load path={}", path.display());
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config = Self::from_toml_str(&fs::read_to_string(path)?)?;
        tracing::debug!(
            "Config loaded: max_retries={}, default_concurrency={}, composition={}",
            config.retry.max_retries,
            config.dispatch.default_concurrency,
            config.composition
        );
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch.default_concurrency == 0 {
            return Err(Error::Validation(
                "dispatch.default_concurrency must be at least 1".to_string(),
            ));
        }
        if self.dispatch.default_timeout_secs == 0 {
            return Err(Error::Validation(
                "dispatch.default_timeout_secs must be positive".to_string(),
            ));
        }
        if self.dispatch.event_capacity == 0 {
            return Err(Error::Validation(
                "dispatch.event_capacity must be at least 1".to_string(),
            ));
        }
        if self.retain_responses == 0 {
            return Err(Error::Validation(
                "retain_responses must be at least 1".to_string(),
            ));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::Validation(
                "retry.base_backoff_ms exceeds retry.max_backoff_ms".to_string(),
            ));
        }
        for (name, cap) in &self.capabilities {
            if cap.concurrency == Some(0) {
                return Err(Error::Validation(format!(
                    "capabilities.{}.concurrency must be at least 1",
                    name
                )));
            }
            if cap.timeout_secs == Some(0) {
                return Err(Error::Validation(format!(
                    "capabilities.{}.timeout_secs must be positive",
                    name
                )));
            }
        }
        Ok(())
    }

    fn overrides(&self, capability: &Capability) -> Option<&CapabilityConfig> {
        self.capabilities
            .iter()
            .find(|(name, _)| Capability::new(name) == *capability)
            .map(|(_, cap)| cap)
    }

    /// Concurrency ceiling set for this capability in the file, if any.
    pub fn concurrency_override(&self, capability: &Capability) -> Option<usize> {
        self.overrides(capability).and_then(|c| c.concurrency)
    }

    /// Per-attempt deadline set for this capability in the file, if any.
    pub fn timeout_override(&self, capability: &Capability) -> Option<Duration> {
        self.overrides(capability)
            .and_then(|c| c.timeout_secs)
            .map(Duration::from_secs)
    }

    pub fn fallback_capability(&self) -> Option<Capability> {
        let cap = Capability::new(&self.default_capability);
        if cap.as_str().is_empty() {
            None
        } else {
            Some(cap)
        }
    }
}
