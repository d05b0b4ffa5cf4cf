use std::fmt::Write as _;
use std::io::Write;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::rules::Alert;
use crate::sink::{AlertSink, SinkError};

const RULE: &str = "###########################################################################";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertFormat {
    /// Human readable block per alert.
    Text,
    /// One JSON object per line.
    Json,
}

impl FromStr for AlertFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "text" => Ok(AlertFormat::Text),
            "json" => Ok(AlertFormat::Json),
            other => Err(format!("Unknown alert format: {other}, must be text or json")),
        }
    }
}

pub fn render_text(alert: &Alert) -> String {
    let entity = &alert.entity;
    let mut out = String::new();

    // Writing to a String cannot fail.
    _ = writeln!(out, "{}", alert.code);
    _ = writeln!(out, "CAUSE: {}", alert.cause);
    _ = writeln!(out, "ACTION: {}", alert.action);
    _ = writeln!(out, "{RULE}");
    _ = writeln!(out, "Entity Guid: {}", entity.guid);
    _ = writeln!(out, "Column Name: {}", entity.column_name);
    _ = writeln!(out, "Qualified Name: {}", entity.qualified_name);
    _ = writeln!(
        out,
        "Data Type: {}",
        entity.data_type.as_deref().unwrap_or("")
    );
    _ = writeln!(out, "Classified As: {}", entity.classification_type);
    _ = writeln!(
        out,
        "Resulting Sensitivity: {}",
        alert.resulting_sensitivity.name
    );
    _ = writeln!(
        out,
        "Declared Sensitivity: {}",
        entity.declared_sensitivity.as_deref().unwrap_or("")
    );
    _ = writeln!(
        out,
        "Current Encryption Type: {}",
        entity.current_encryption
    );
    _ = writeln!(
        out,
        "Desired Encryption Type: {}",
        alert.required_encryption
    );
    _ = writeln!(
        out,
        "Update Time: {}",
        entity
            .updated_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default()
    );
    _ = writeln!(out, "{RULE}");

    out
}

/// Writes alerts to stdout (or any writer), kept apart from operational logs
/// which go to stderr.
pub struct ConsoleAlertSink {
    format: AlertFormat,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleAlertSink {
    pub fn stdout(format: AlertFormat) -> Self {
        Self::new(format, Box::new(std::io::stdout()))
    }

    pub fn new(format: AlertFormat, writer: Box<dyn Write + Send>) -> Self {
        Self {
            format,
            writer: Mutex::new(writer),
        }
    }

    fn render(&self, alert: &Alert) -> Result<String, SinkError> {
        match self.format {
            AlertFormat::Text => Ok(render_text(alert)),
            AlertFormat::Json => {
                let mut line = serde_json::to_string(alert)?;
                line.push('\n');
                Ok(line)
            }
        }
    }
}

#[async_trait]
impl AlertSink for ConsoleAlertSink {
    async fn emit(&self, alert: &Alert) -> Result<(), SinkError> {
        let rendered = self.render(alert)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("alert writer lock poisoned"))?;
        writer.write_all(rendered.as_bytes())?;
        writer.flush()?;
        Ok(())
    }
}
