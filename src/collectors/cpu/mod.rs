pub mod proc_stat;

use std::path::PathBuf;

use chrono::Utc;
use serde::Deserialize;

use super::{parse_options, Accumulator, Collector, CollectorError, Fields, Registry, Tags, Value};

pub const NAME: &str = "cpu";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct Options {
    proc_path: PathBuf,
    per_cpu: bool,
    total: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            proc_path: PathBuf::from("/proc"),
            per_cpu: true,
            total: true,
        }
    }
}

/// Raw cumulative tick counters from `/proc/stat`.
pub struct CPUCollector {
    options: Options,
}

impl CPUCollector {
    pub fn new() -> Self {
        Self {
            options: Options::default(),
        }
    }
}

impl Default for CPUCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for CPUCollector {
    fn description(&self) -> &'static str {
        "Per-CPU and total tick counters from /proc/stat"
    }

    fn sample_config(&self) -> &'static str {
        "# Report each cpu separately\nper_cpu = true\n# Report the aggregate cpu line\ntotal = true\n# proc_path = \"/proc\"\n"
    }

    fn configure(&mut self, options: &toml::Table) -> Result<(), CollectorError> {
        let options: Options = parse_options(options)?;
        if !options.per_cpu && !options.total {
            return Err(CollectorError::Config(
                "per_cpu and total cannot both be false".to_string(),
            ));
        }
        self.options = options;
        Ok(())
    }

    fn gather(&mut self, acc: &mut Accumulator) -> Result<(), CollectorError> {
        let content = std::fs::read_to_string(self.options.proc_path.join("stat"))?;
        let now = Utc::now();

        for cpu in proc_stat::parse(&content)? {
            let wanted = if cpu.is_total() {
                self.options.total
            } else {
                self.options.per_cpu
            };
            if !wanted {
                continue;
            }

            let mut fields = Fields::with_capacity(cpu.ticks.len());
            for (name, ticks) in &cpu.ticks {
                fields.insert(name.to_string(), Value::try_from(*ticks)?);
            }

            let mut tags = Tags::new();
            tags.insert("cpu".to_string(), cpu.cpu);
            acc.add_values_with_time("ticks", fields, tags, now);
        }

        Ok(())
    }
}

pub fn register(registry: &mut Registry) -> crate::Result<()> {
    registry.register(NAME, || Box::new(CPUCollector::new()))
}
