use crate::io::config::StackConfig;
use crate::types::StackResult;
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::Path;

/// Plain-text record of a distributed run
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub started: DateTime<Utc>,
    pub workers: usize,
    /// Effective configuration in `key: value` form
    pub config_text: String,
    pub inputs: Vec<String>,
}

impl RunRecord {
    pub fn new(config: &StackConfig) -> Self {
        Self {
            started: Utc::now(),
            workers: config.processes,
            config_text: config.to_config_text(),
            inputs: Vec::new(),
        }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    pub fn render(&self) -> String {
        let mut text = format!(
            "Starting Simulation at: {}\n",
            self.started.format("%Y-%m-%d %H:%M:%S")
        );
        text.push_str(&format!("Coordinator found {} worker processes.\n\n", self.workers));
        text.push_str("Config Settings: start\n");
        text.push_str(&self.config_text);
        if !self.config_text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str("Config Settings: end\n");

        if !self.inputs.is_empty() {
            text.push_str("\nInput files:\n");
            for input in &self.inputs {
                text.push_str(input);
                text.push('\n');
            }
        }
        text
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> StackResult<()> {
        writer.write_all(self.render().as_bytes())?;
        Ok(())
    }

    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> StackResult<()> {
        log::info!("Writing run record: {}", path.as_ref().display());
        let mut file = std::fs::File::create(path)?;
        self.write_to(&mut file)
    }
}
