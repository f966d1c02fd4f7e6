use std::process::Command;

use chrono::Utc;
use serde::Deserialize;

use super::{parse_options, Accumulator, Collector, CollectorError, Fields, Registry, Tags, Value};

pub const NAME: &str = "exec";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Options {
    command: Vec<String>,
    #[serde(default = "default_measurement")]
    name: String,
    #[serde(default)]
    tags: Tags,
}

fn default_measurement() -> String {
    NAME.to_string()
}

/// Runs a helper program and reports the scalar members of the JSON object
/// it prints on stdout.
#[derive(Default)]
pub struct ExecCollector {
    options: Options,
}

impl ExecCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Turn helper output into fields. Every member must be a scalar.
fn parse_output(stdout: &[u8]) -> Result<Fields, CollectorError> {
    let object = match serde_json::from_slice::<serde_json::Value>(stdout)? {
        serde_json::Value::Object(object) => object,
        other => {
            return Err(CollectorError::Parse(format!(
                "expected a JSON object, got {}",
                other
            )))
        }
    };

    object
        .into_iter()
        .map(|(key, value)| {
            Value::try_from(value)
                .map(|v| (key.clone(), v))
                .map_err(|e| CollectorError::Parse(format!("field '{}': {}", key, e)))
        })
        .collect()
}

impl Collector for ExecCollector {
    fn description(&self) -> &'static str {
        "Run a command and read metrics from its JSON output"
    }

    fn sample_config(&self) -> &'static str {
        "# Program and arguments; must print a flat JSON object\ncommand = [\"/usr/local/bin/report\", \"--json\"]\n# Measurement name, prefixed with \"exec_\"\nname = \"report\"\n# tags = { role = \"db\" }\n"
    }

    fn configure(&mut self, options: &toml::Table) -> Result<(), CollectorError> {
        let options: Options = parse_options(options)?;
        if options.command.is_empty() {
            return Err(CollectorError::Config("command must not be empty".to_string()));
        }
        self.options = options;
        Ok(())
    }

    fn gather(&mut self, acc: &mut Accumulator) -> Result<(), CollectorError> {
        let (program, args) = self
            .options
            .command
            .split_first()
            .ok_or_else(|| CollectorError::Config("command is not configured".to_string()))?;

        let output = Command::new(program).args(args).output()?;
        if !output.status.success() {
            return Err(CollectorError::Command(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let fields = parse_output(&output.stdout)?;
        acc.add_values_with_time(&self.options.name, fields, self.options.tags.clone(), Utc::now());
        Ok(())
    }
}

pub fn register(registry: &mut Registry) -> crate::Result<()> {
    registry.register(NAME, || Box::new(ExecCollector::new()))
}
