use std::path::PathBuf;

use chrono::Utc;
use serde::Deserialize;

use super::{parse_options, Accumulator, Collector, CollectorError, Fields, Registry, Tags, Value};

pub const NAME: &str = "system";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct Options {
    proc_path: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            proc_path: PathBuf::from("/proc"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct LoadAvg {
    load1: f64,
    load5: f64,
    load15: f64,
    running: i64,
    total: i64,
}

fn parse_loadavg(content: &str) -> Result<LoadAvg, CollectorError> {
    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 4 {
        return Err(CollectorError::Parse(format!("malformed loadavg: {:?}", content.trim())));
    }

    let load = |i: usize| {
        parts[i]
            .parse::<f64>()
            .map_err(|e| CollectorError::Parse(format!("loadavg: {}", e)))
    };
    let (running, total) = parts[3]
        .split_once('/')
        .ok_or_else(|| CollectorError::Parse(format!("loadavg tasks: {}", parts[3])))?;
    let count = |s: &str| {
        s.parse::<i64>()
            .map_err(|e| CollectorError::Parse(format!("loadavg tasks: {}", e)))
    };

    Ok(LoadAvg {
        load1: load(0)?,
        load5: load(1)?,
        load15: load(2)?,
        running: count(running)?,
        total: count(total)?,
    })
}

fn parse_uptime(content: &str) -> Result<i64, CollectorError> {
    content
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .map(|secs| secs as i64)
        .ok_or_else(|| CollectorError::Parse(format!("malformed uptime: {:?}", content.trim())))
}

/// Load averages, task counts and uptime.
#[derive(Default)]
pub struct SystemCollector {
    options: Options,
}

impl SystemCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Collector for SystemCollector {
    fn description(&self) -> &'static str {
        "Load averages and uptime from /proc/loadavg and /proc/uptime"
    }

    fn sample_config(&self) -> &'static str {
        "# proc_path = \"/proc\"\n"
    }

    fn configure(&mut self, options: &toml::Table) -> Result<(), CollectorError> {
        self.options = parse_options(options)?;
        Ok(())
    }

    fn gather(&mut self, acc: &mut Accumulator) -> Result<(), CollectorError> {
        let proc_path = &self.options.proc_path;
        let load = parse_loadavg(&std::fs::read_to_string(proc_path.join("loadavg"))?)?;
        let uptime = parse_uptime(&std::fs::read_to_string(proc_path.join("uptime"))?)?;

        let mut fields = Fields::new();
        fields.insert("load1".to_string(), Value::from(load.load1));
        fields.insert("load5".to_string(), Value::from(load.load5));
        fields.insert("load15".to_string(), Value::from(load.load15));
        fields.insert("n_running".to_string(), Value::from(load.running));
        fields.insert("n_total".to_string(), Value::from(load.total));
        fields.insert("uptime".to_string(), Value::from(uptime));

        acc.add_values_with_time("", fields, Tags::new(), Utc::now());
        Ok(())
    }
}

pub fn register(registry: &mut Registry) -> crate::Result<()> {
    registry.register(NAME, || Box::new(SystemCollector::new()))
}
