//! Downstream writers the sink worker forwards records to

use super::record::{LogRecord, Severity};
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, info, trace, warn};

/// A destination for log records
///
/// Writers are called from the single sink worker, in emission order.
pub trait LogWriter: Send + Sync {
    fn name(&self) -> &str;

    fn write(&self, record: &LogRecord) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Re-emits records as `tracing` events so they reach the installed subscriber
#[derive(Debug, Default, Clone)]
pub struct TracingWriter;

impl LogWriter for TracingWriter {
    fn name(&self) -> &str {
        "tracing"
    }

    fn write(&self, record: &LogRecord) -> Result<()> {
        let fields = serde_json::to_string(&record.fields)?;
        let source = record.source.as_str();
        let message = record.message.as_str();
        match record.severity {
            Severity::Trace => trace!(source = %source, fields = %fields, "{}", message),
            Severity::Debug => debug!(source = %source, fields = %fields, "{}", message),
            Severity::Info => info!(source = %source, fields = %fields, "{}", message),
            Severity::Warning => warn!(source = %source, fields = %fields, "{}", message),
            Severity::Error | Severity::Critical => error!(
                source = %source,
                severity = %record.severity,
                fields = %fields,
                "{}",
                message
            ),
        }
        Ok(())
    }
}

/// Appends one JSON document per record to a file
pub struct JsonLinesWriter {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl JsonLinesWriter {
    /// Open (or create) the target file in append mode
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogWriter for JsonLinesWriter {
    fn name(&self) -> &str {
        "json_lines"
    }

    fn write(&self, record: &LogRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.flush()
            .with_context(|| format!("Failed to flush log file {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_json_lines_writer_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("governance.log");

        let writer = JsonLinesWriter::open(&path).unwrap();
        writer
            .write(&LogRecord::new(Severity::Info, "tuner", "first").with_field("batch", 100i64))
            .unwrap();
        writer
            .write(&LogRecord::new(Severity::Error, "breaker", "second"))
            .unwrap();
        writer.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: LogRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.message, "first");
        assert_eq!(first.source, "tuner");
        let second: LogRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.severity, Severity::Error);
    }

    #[test]
    fn test_tracing_writer_accepts_all_severities() {
        let writer = TracingWriter;
        for severity in [
            Severity::Trace,
            Severity::Debug,
            Severity::Info,
            Severity::Warning,
            Severity::Error,
            Severity::Critical,
        ] {
            assert!(writer
                .write(&LogRecord::new(severity, "test", "hello"))
                .is_ok());
        }
    }
}
