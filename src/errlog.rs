//! Append-only error log files.
//!
//! Transient archive failures are expected by the thousand over a long run;
//! they go to a dedicated log file next to the database with full context,
//! keeping the progress display and the tracing stream readable.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;

/// One append-only log file. Writes are serialized and flushed per entry so
/// a crash never loses context for errors that already happened.
pub struct ErrorLog {
    file: Mutex<File>,
}

impl ErrorLog {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one entry: a context line, then the error chain.
    pub fn record(&self, context: &str, error: &dyn std::error::Error) {
        let mut entry = format!("{} {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"), context);
        entry.push_str(&format!("  {}\n", error));
        let mut source = error.source();
        while let Some(cause) = source {
            entry.push_str(&format!("  caused by: {}\n", cause));
            source = cause.source();
        }
        self.write(&entry);
    }

    /// Append one entry for an error with a dynamic cause chain.
    pub fn record_chain(&self, context: &str, error: &anyhow::Error) {
        let mut entry = format!("{} {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"), context);
        for cause in error.chain() {
            entry.push_str(&format!("  {}\n", cause));
        }
        self.write(&entry);
    }

    /// Append a free-form line (CDX parse errors and the like).
    pub fn note(&self, message: &str) {
        self.write(&format!(
            "{} {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            message
        ));
    }

    fn write(&self, entry: &str) {
        let mut file = self.file.lock().unwrap();
        let _ = file.write_all(entry.as_bytes());
        let _ = file.flush();
    }
}
