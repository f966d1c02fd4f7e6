use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::Deserialize;

use super::{parse_options, Accumulator, Collector, CollectorError, Fields, Registry, Tags, Value};

pub const NAME: &str = "mem";

/// `/proc/meminfo` key to field name.
const FIELDS: [(&str, &str); 7] = [
    ("MemTotal", "total"),
    ("MemFree", "free"),
    ("MemAvailable", "available"),
    ("Buffers", "buffers"),
    ("Cached", "cached"),
    ("SwapTotal", "swap_total"),
    ("SwapFree", "swap_free"),
];

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

/// Memory usage in bytes from `/proc/meminfo`.
#[derive(Default)]
pub struct MemCollector {
    options: Options,
}

impl MemCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Parse `/proc/meminfo` into bytes per key.
fn parse_meminfo(content: &str) -> Result<HashMap<&str, u64>, CollectorError> {
    let mut values = HashMap::new();
    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let Some(raw) = parts.next() else {
            continue;
        };
        let amount: u64 = raw
            .parse()
            .map_err(|e| CollectorError::Parse(format!("{}: {}", key, e)))?;
        let bytes = match parts.next() {
            Some("kB") => amount.saturating_mul(1024),
            _ => amount,
        };
        values.insert(key.trim(), bytes);
    }
    Ok(values)
}

impl Collector for MemCollector {
    fn description(&self) -> &'static str {
        "Memory and swap usage from /proc/meminfo"
    }

    fn sample_config(&self) -> &'static str {
        "# proc_path = \"/proc\"\n"
    }

    fn configure(&mut self, options: &toml::Table) -> Result<(), CollectorError> {
        self.options = parse_options(options)?;
        Ok(())
    }

    fn gather(&mut self, acc: &mut Accumulator) -> Result<(), CollectorError> {
        let content = std::fs::read_to_string(self.options.proc_path.join("meminfo"))?;
        let info = parse_meminfo(&content)?;

        let total = *info
            .get("MemTotal")
            .ok_or_else(|| CollectorError::Parse("MemTotal missing".to_string()))?;

        let mut fields = Fields::new();
        for (key, field) in FIELDS {
            if let Some(bytes) = info.get(key) {
                fields.insert(field.to_string(), Value::try_from(*bytes)?);
            }
        }

        // Kernels before 3.14 do not report MemAvailable.
        let available = info
            .get("MemAvailable")
            .copied()
            .unwrap_or_else(|| {
                ["MemFree", "Buffers", "Cached"]
                    .iter()
                    .filter_map(|k| info.get(k))
                    .sum()
            });
        if total > 0 {
            let used = total.saturating_sub(available);
            fields.insert(
                "used_percent".to_string(),
                Value::from(used as f64 / total as f64 * 100.0),
            );
        }

        acc.add_values_with_time("", fields, Tags::new(), Utc::now());
        Ok(())
    }
}

pub fn register(registry: &mut Registry) -> crate::Result<()> {
    registry.register(NAME, || Box::new(MemCollector::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::ChannelSink;
    use std::sync::Arc;

    const MEMINFO: &str = "\
MemTotal:        1000 kB
MemFree:          200 kB
MemAvailable:     250 kB
Buffers:           10 kB
Cached:            40 kB
SwapTotal:          0 kB
SwapFree:           0 kB
HugePages_Total:       0
";

    #[test]
    fn test_parse_meminfo() {
        let info = parse_meminfo(MEMINFO).unwrap();
        assert_eq!(info["MemTotal"], 1000 * 1024);
        assert_eq!(info["HugePages_Total"], 0);
    }

    #[test]
    fn test_gather_mem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();

        let mut options = toml::Table::new();
        options.insert(
            "proc_path".to_string(),
            toml::Value::String(dir.path().to_string_lossy().into_owned()),
        );
        let mut collector = MemCollector::new();
        collector.configure(&options).unwrap();

        let (sink, mut rx) = ChannelSink::channel();
        let mut acc = Accumulator::new(NAME, Arc::new(sink));
        collector.gather(&mut acc).unwrap();

        let m = rx.try_recv().unwrap();
        assert_eq!(m.name(), "mem");
        assert_eq!(m.field("total"), Some(&Value::Int(1024000)));
        assert_eq!(m.field("available"), Some(&Value::Int(256000)));
        assert_eq!(m.field("used_percent"), Some(&Value::Float(75.0)));
    }

    #[test]
    fn test_missing_total() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("meminfo"), "MemFree: 1 kB\n").unwrap();

        let mut options = toml::Table::new();
        options.insert(
            "proc_path".to_string(),
            toml::Value::String(dir.path().to_string_lossy().into_owned()),
        );
        let mut collector = MemCollector::new();
        collector.configure(&options).unwrap();

        let (sink, _rx) = ChannelSink::channel();
        let mut acc = Accumulator::new(NAME, Arc::new(sink));
        assert!(matches!(collector.gather(&mut acc), Err(CollectorError::Parse(_))));
    }
}
