use crate::collectors::CollectorError;

/// Column names of a `cpu` line in `/proc/stat`, in kernel order.
pub const TICK_FIELDS: [&str; 8] = [
    "user", "nice", "system", "idle", "iowait", "irq", "softirq", "steal",
];

#[derive(Debug, Clone, PartialEq)]
pub struct CpuTicks {
    /// `cpu-total` for the aggregate line, `cpuN` otherwise.
    pub cpu: String,
    /// Present columns, paired with their names. Older kernels report fewer.
    pub ticks: Vec<(&'static str, u64)>,
}

impl CpuTicks {
    pub fn is_total(&self) -> bool {
        self.cpu == "cpu-total"
    }
}

pub fn parse(content: &str) -> Result<Vec<CpuTicks>, CollectorError> {
    let mut cpus = Vec::new();

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let label = match parts.next() {
            Some(label) if label.starts_with("cpu") => label,
            _ => continue,
        };

        let ticks = TICK_FIELDS
            .iter()
            .zip(parts)
            .map(|(name, raw)| {
                raw.parse::<u64>()
                    .map(|v| (*name, v))
                    .map_err(|e| CollectorError::Parse(format!("{} {}: {}", label, name, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if ticks.len() < 4 {
            return Err(CollectorError::Parse(format!("truncated line for {}", label)));
        }

        let cpu = if label == "cpu" {
            "cpu-total".to_string()
        } else {
            label.to_string()
        };
        cpus.push(CpuTicks { cpu, ticks });
    }

    if cpus.is_empty() {
        return Err(CollectorError::Parse("no cpu lines found".to_string()));
    }
    Ok(cpus)
}
