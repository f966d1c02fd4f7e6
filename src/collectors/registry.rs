//! Name to factory table for input plugins.

use std::collections::BTreeMap;
use std::fmt::Write;

use super::Collector;
use crate::{Error, Result};

type Factory = Box<dyn Fn() -> Box<dyn Collector> + Send + Sync>;

/// Filled once at startup by an explicit registration pass, then shared
/// read-only (behind an `Arc`) with the scheduler.
#[derive(Default)]
pub struct Registry {
    factories: BTreeMap<String, Factory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all built-in collectors.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        super::register_builtin(&mut registry)?;
        Ok(registry)
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Collector> + Send + Sync + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::EmptyPluginName);
        }
        if self.factories.contains_key(&name) {
            return Err(Error::RegistrationConflict { name });
        }
        tracing::debug!(plugin = %name, "Plugin registered");
        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    /// Build a fresh, independent instance of `name`.
    pub fn instantiate(&self, name: &str) -> Result<Box<dyn Collector>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| Error::UnknownPlugin {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// `(name, description)` for every plugin, sorted by name.
    pub fn descriptions(&self) -> Vec<(&str, &'static str)> {
        self.factories
            .iter()
            .map(|(name, factory)| (name.as_str(), factory().description()))
            .collect()
    }

    /// Sample configuration of every plugin, concatenated.
    pub fn sample_config(&self) -> String {
        let mut out = String::new();
        for (name, factory) in &self.factories {
            let collector = factory();
            let _ = writeln!(out, "# {}", collector.description());
            let _ = writeln!(out, "[[inputs.{}]]", name);
            for line in collector.sample_config().lines() {
                let _ = writeln!(out, "  {}", line);
            }
            out.push('\n');
        }
        out
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("plugins", &self.names())
            .finish()
    }
}
