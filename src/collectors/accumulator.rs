use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::types::{Fields, Measurement, Tags, Value};

/// Field name used by the single-value [`Accumulator::add`] shorthand.
pub const VALUE_FIELD: &str = "value";

/// Downstream consumer of measurements. Shared by every plugin task, so
/// implementations must tolerate concurrent calls.
pub trait Sink: Send + Sync {
    fn emit(&self, measurement: Measurement);
}

/// Hands measurements to a tokio channel drained by the output loop.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Measurement>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Measurement>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Measurement>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl Sink for ChannelSink {
    fn emit(&self, measurement: Measurement) {
        if let Err(e) = self.tx.send(measurement) {
            tracing::debug!(measurement = %e.0.name(), "Output channel closed, dropping measurement");
        }
    }
}

/// Per-invocation handle a collector writes to.
///
/// Every measurement is named `{plugin}_{measurement}`, where `plugin` is the
/// registered name of the owning plugin. Collectors have no way to emit a
/// measurement outside that namespace.
pub struct Accumulator {
    plugin: String,
    sink: Arc<dyn Sink>,
    emitted: usize,
}

impl Accumulator {
    pub fn new(plugin: impl Into<String>, sink: Arc<dyn Sink>) -> Self {
        Self {
            plugin: plugin.into(),
            sink,
            emitted: 0,
        }
    }

    /// Registered name of the plugin this accumulator belongs to.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Number of measurements forwarded so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Emit a single-field measurement stamped with the current time.
    pub fn add(&mut self, measurement: &str, value: impl Into<Value>, tags: Tags) {
        let mut fields = Fields::with_capacity(1);
        fields.insert(VALUE_FIELD.to_string(), value.into());
        self.push(measurement, fields, tags, Utc::now());
    }

    /// Emit a multi-field measurement carrying its own event timestamp.
    ///
    /// A call with no usable fields produces nothing.
    pub fn add_values_with_time(
        &mut self,
        measurement: &str,
        values: Fields,
        tags: Tags,
        timestamp: DateTime<Utc>,
    ) {
        self.push(measurement, values, tags, timestamp);
    }

    fn push(&mut self, measurement: &str, mut fields: Fields, mut tags: Tags, timestamp: DateTime<Utc>) {
        fields.retain(|name, _| !name.is_empty());
        if fields.is_empty() {
            tracing::warn!(plugin = %self.plugin, measurement, "Measurement has no fields, skipping");
            return;
        }

        tags.retain(|key, value| {
            let keep = !key.is_empty() && !value.is_empty();
            if !keep {
                tracing::debug!(plugin = %self.plugin, measurement, tag = %key, "Dropping empty tag");
            }
            keep
        });

        let name = self.qualify(measurement);
        self.sink.emit(Measurement::new(name, fields, tags, timestamp));
        self.emitted += 1;
    }

    fn qualify(&self, measurement: &str) -> String {
        if measurement.is_empty() {
            self.plugin.clone()
        } else {
            format!("{}_{}", self.plugin, measurement)
        }
    }
}

impl std::fmt::Debug for Accumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accumulator")
            .field("plugin", &self.plugin)
            .field("emitted", &self.emitted)
            .finish_non_exhaustive()
    }
}
