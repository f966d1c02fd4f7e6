//! Agent configuration file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Shortest interval an input may be scheduled at.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Keys of an `[[inputs.NAME]]` table consumed by the agent rather than the
/// collector.
const RESERVED_KEYS: [&str; 3] = ["interval_secs", "timeout_secs", "required"];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AgentSettings {
    pub interval_secs: u64,
    /// 0 disables the per-gather timeout.
    pub timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub flush_interval_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            timeout_secs: 5,
            shutdown_timeout_secs: 5,
            flush_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OutputSettings {
    pub stdout: bool,
    pub sqlite: Option<PathBuf>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            stdout: true,
            sqlite: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub outputs: OutputSettings,
    #[serde(default)]
    inputs: BTreeMap<String, Vec<toml::Table>>,
}

/// One `[[inputs.NAME]]` entry with agent keys resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct InputConfig {
    pub plugin: String,
    pub interval: Duration,
    pub timeout: Option<Duration>,
    pub required: bool,
    /// Everything else, for the collector's `configure`.
    pub options: toml::Table,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.shutdown_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.agent.flush_interval_secs.max(1))
    }

    /// Resolve every configured input, in plugin-name order and then file
    /// order.
    pub fn inputs(&self) -> Result<Vec<InputConfig>> {
        let mut inputs = Vec::new();
        for (plugin, entries) in &self.inputs {
            for entry in entries {
                inputs.push(self.resolve_input(plugin, entry)?);
            }
        }
        Ok(inputs)
    }

    fn resolve_input(&self, plugin: &str, entry: &toml::Table) -> Result<InputConfig> {
        let mut options = entry.clone();
        for key in RESERVED_KEYS {
            options.remove(key);
        }

        let secs = |key: &str, default: u64| -> Result<u64> {
            match entry.get(key) {
                None => Ok(default),
                Some(toml::Value::Integer(v)) if *v >= 0 => Ok(*v as u64),
                Some(other) => Err(Error::Config(format!(
                    "inputs.{}: {} must be a non-negative integer, got {}",
                    plugin, key, other
                ))),
            }
        };

        let required = match entry.get("required") {
            None => false,
            Some(toml::Value::Boolean(b)) => *b,
            Some(other) => {
                return Err(Error::Config(format!(
                    "inputs.{}: required must be a boolean, got {}",
                    plugin, other
                )))
            }
        };

        let mut interval = Duration::from_secs(secs("interval_secs", self.agent.interval_secs)?);
        if interval < MIN_INTERVAL {
            tracing::warn!(plugin, min_interval = ?MIN_INTERVAL, "Interval below minimum, using minimum");
            interval = MIN_INTERVAL;
        }

        let timeout = match secs("timeout_secs", self.agent.timeout_secs)? {
            0 => None,
            n => Some(Duration::from_secs(n)),
        };

        Ok(InputConfig {
            plugin: plugin.to_string(),
            interval,
            timeout,
            required,
            options,
        })
    }
}
