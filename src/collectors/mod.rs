pub mod types;
pub mod accumulator;
pub mod registry;
pub mod simple;
pub mod cpu;
pub mod mem;
pub mod system;
pub mod exec;

use serde::de::DeserializeOwned;
use thiserror::Error;

pub use types::*;
pub use accumulator::{Accumulator, ChannelSink, Sink, VALUE_FIELD};
pub use registry::Registry;
pub use simple::SimpleCollector;
pub use cpu::CPUCollector;
pub use mem::MemCollector;
pub use system::SystemCollector;
pub use exec::ExecCollector;

/// Errors a collector may return from a single gather.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("invalid value: {0}")]
    Value(#[from] ValueError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Contract every input plugin implements.
///
/// An instance is owned by exactly one scheduling task, and `gather` is never
/// entered twice at the same time for the same instance. Collectors can keep
/// mutable state between calls without locking.
pub trait Collector: Send {
    /// One-line description shown by `--list`.
    fn description(&self) -> &'static str;

    /// TOML documenting the options this collector understands.
    fn sample_config(&self) -> &'static str;

    /// Apply the options from this instance's `[[inputs.NAME]]` table.
    /// Called once, before the first gather.
    fn configure(&mut self, options: &toml::Table) -> Result<(), CollectorError> {
        if let Some(key) = options.keys().next() {
            return Err(CollectorError::Config(format!("unknown option '{}'", key)));
        }
        Ok(())
    }

    /// Collect once, writing results to `acc`. May block on I/O.
    fn gather(&mut self, acc: &mut Accumulator) -> Result<(), CollectorError>;
}

/// Deserialize an options table into a collector's typed settings.
pub fn parse_options<T: DeserializeOwned>(options: &toml::Table) -> Result<T, CollectorError> {
    toml::Value::Table(options.clone())
        .try_into()
        .map_err(|e: toml::de::Error| CollectorError::Config(e.message().to_string()))
}

/// Register every built-in collector. Must run before the scheduler resolves
/// any configured input.
pub fn register_builtin(registry: &mut Registry) -> crate::Result<()> {
    simple::register(registry)?;
    cpu::register(registry)?;
    mem::register(registry)?;
    system::register(registry)?;
    exec::register(registry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields)]
    struct Opts {
        #[serde(default)]
        flag: bool,
    }

    #[test]
    fn test_parse_options() {
        let table: toml::Table = toml::from_str("flag = true").unwrap();
        assert_eq!(parse_options::<Opts>(&table).unwrap(), Opts { flag: true });

        let table: toml::Table = toml::from_str("flga = true").unwrap();
        let err = parse_options::<Opts>(&table).unwrap_err();
        assert!(err.to_string().contains("flga"), "{}", err);
    }

    #[test]
    fn test_builtin_names() {
        let mut registry = Registry::new();
        register_builtin(&mut registry).unwrap();
        assert_eq!(registry.names(), vec!["cpu", "exec", "mem", "simple", "system"]);

        // a second pass collides on the first name
        assert!(matches!(
            register_builtin(&mut registry),
            Err(crate::Error::RegistrationConflict { name }) if name == "simple"
        ));
    }
}
