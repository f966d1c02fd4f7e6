use serde::Deserialize;

use super::{parse_options, Accumulator, Collector, CollectorError, Registry, Tags};

pub const NAME: &str = "simple";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Options {
    #[serde(default)]
    ok: bool,
}

/// Reference collector: reports a single state string.
#[derive(Debug, Default)]
pub struct SimpleCollector {
    ok: bool,
}

impl SimpleCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Collector for SimpleCollector {
    fn description(&self) -> &'static str {
        "A do-nothing collector that reports whether it is ok"
    }

    fn sample_config(&self) -> &'static str {
        "# Report \"pretty good\" when true, \"not great\" otherwise\nok = true\n"
    }

    fn configure(&mut self, options: &toml::Table) -> Result<(), CollectorError> {
        let options: Options = parse_options(options)?;
        self.ok = options.ok;
        Ok(())
    }

    fn gather(&mut self, acc: &mut Accumulator) -> Result<(), CollectorError> {
        let state = if self.ok { "pretty good" } else { "not great" };
        acc.add("state", state, Tags::new());
        Ok(())
    }
}

pub fn register(registry: &mut Registry) -> crate::Result<()> {
    registry.register(NAME, || Box::new(SimpleCollector::new()))
}
