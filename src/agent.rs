//! Wires configuration, registry, scheduler and outputs together.

use std::future::Future;
use std::sync::Arc;

use crate::collectors::{ChannelSink, Measurement, Registry, Sink};
use crate::config::{Config, InputConfig};
use crate::scheduler::{Instance, Scheduler};
use crate::storage::{JsonLinesStorage, SqliteStorage, Storage};
use crate::{Error, Result};

pub struct Agent {
    config: Config,
    registry: Arc<Registry>,
}

impl Agent {
    /// `registry` must already hold every plugin the configuration may name.
    pub fn new(config: Config, registry: Registry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Instantiate and configure every input.
    ///
    /// An input that names an unknown plugin or fails to configure is skipped
    /// with an error log, unless it is marked `required`, in which case the
    /// error is returned.
    pub fn instances(&self) -> Result<Vec<Instance>> {
        let mut instances = Vec::new();
        for input in self.config.inputs()? {
            match self.build_instance(&input) {
                Ok(instance) => instances.push(instance),
                Err(e) if input.required => return Err(e),
                Err(e) => tracing::error!(plugin = %input.plugin, error = %e, "Skipping input"),
            }
        }
        Ok(instances)
    }

    fn build_instance(&self, input: &InputConfig) -> Result<Instance> {
        let mut collector = self.registry.instantiate(&input.plugin)?;
        collector
            .configure(&input.options)
            .map_err(|source| Error::PluginConfig {
                name: input.plugin.clone(),
                source,
            })?;
        Ok(Instance::new(&input.plugin, collector, input.interval).with_timeout(input.timeout))
    }

    /// Open and initialize every configured output.
    pub fn outputs(&self) -> Result<Vec<Box<dyn Storage>>> {
        let mut outputs: Vec<Box<dyn Storage>> = Vec::new();
        if let Some(path) = &self.config.outputs.sqlite {
            outputs.push(Box::new(SqliteStorage::new(Some(path.clone()))));
        }
        if self.config.outputs.stdout {
            outputs.push(Box::new(JsonLinesStorage::stdout()));
        }
        for output in &outputs {
            output.initialize()?;
            tracing::info!(output = output.name(), "Output ready");
        }
        Ok(outputs)
    }

    /// Gather every input once and return what was emitted. Failed inputs
    /// are logged and contribute nothing.
    pub async fn test(&self) -> Result<Vec<Measurement>> {
        let (sink, mut rx) = ChannelSink::channel();
        let sink: Arc<dyn Sink> = Arc::new(sink);

        for instance in self.instances()? {
            let plugin = instance.plugin().to_string();
            if let Err(e) = instance.gather_once(Arc::clone(&sink)).await {
                tracing::error!(plugin = %plugin, error = %e, "Gather failed");
            }
        }

        let mut measurements = Vec::new();
        while let Ok(m) = rx.try_recv() {
            measurements.push(m);
        }
        Ok(measurements)
    }

    /// Run until `shutdown` resolves, then stop the scheduler, drain what is
    /// left and flush it.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let outputs = self.outputs()?;
        let instances = self.instances()?;
        if instances.is_empty() {
            return Err(Error::Config("no inputs configured".to_string()));
        }

        let (sink, mut rx) = ChannelSink::channel();
        let mut scheduler = Scheduler::new(Arc::new(sink));
        for instance in instances {
            scheduler.spawn(instance);
        }
        tracing::info!(inputs = scheduler.len(), outputs = outputs.len(), "Agent started");

        let mut flush = tokio::time::interval(self.config.flush_interval());
        flush.tick().await;
        let mut buffer: Vec<Measurement> = Vec::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(measurement) = rx.recv() => buffer.push(measurement),
                _ = flush.tick() => flush_batch(&outputs, &mut buffer),
            }
        }

        tracing::info!("Shutting down");
        scheduler.shutdown(self.config.shutdown_timeout()).await;
        while let Ok(measurement) = rx.try_recv() {
            buffer.push(measurement);
        }
        flush_batch(&outputs, &mut buffer);
        Ok(())
    }
}

fn flush_batch(outputs: &[Box<dyn Storage>], buffer: &mut Vec<Measurement>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    for output in outputs {
        match output.store_measurements(batch.clone()) {
            Ok(round) => tracing::debug!(
                output = output.name(),
                round = %round.id,
                count = round.measurements_count,
                "Batch written"
            ),
            Err(e) => tracing::error!(output = output.name(), error = %e, "Failed to write batch"),
        }
    }
}
