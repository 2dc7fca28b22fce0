//! Append-only data sinks for received telemetry: a text log and a CSV table.
//!
//! Every connection shares one [`DualSink`]. All appends (header check
//! included) go through a single async lock, so rows from different clients
//! never interleave and the CSV header is written exactly once.

// Shared ownership of the sink across connection tasks
use std::sync::Arc;

// File locations
use std::path::{Path, PathBuf};

use std::io;

// Async file I/O and the write-coordination lock
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

// Reading `celsius` / `fahrenheit` out of arbitrary JSON
use serde_json::Value as JsonValue;

use thiserror::Error;

use crate::config::ServerConfig;
use crate::logger::Logger;
use crate::server::decoder::DecodedMessage;

/// First line of a freshly created CSV file.
pub const CSV_HEADER: &str = "timestamp,client,celsius,fahrenheit\n";

/// A failed append to one of the sink files.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("could not open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Both sink files plus the lock that serializes writes to them.
struct SinkFiles {
    log_path: PathBuf,
    csv_path: PathBuf,
    write_lock: Mutex<()>,
}

/// Process-wide handle to the log and CSV sinks. Cloning is cheap.
#[derive(Clone)]
pub struct DualSink {
    inner: Arc<SinkFiles>,
    logger: Logger,
}

impl DualSink {
    pub fn new(log_path: impl Into<PathBuf>, csv_path: impl Into<PathBuf>, logger: Logger) -> Self {
        Self {
            inner: Arc::new(SinkFiles {
                log_path: log_path.into(),
                csv_path: csv_path.into(),
                write_lock: Mutex::new(()),
            }),
            logger,
        }
    }

    pub fn from_config(config: &ServerConfig, logger: Logger) -> Self {
        Self::new(config.log_path.clone(), config.csv_path.clone(), logger)
    }

    pub fn log_path(&self) -> &Path {
        &self.inner.log_path
    }

    pub fn csv_path(&self) -> &Path {
        &self.inner.csv_path
    }

    /// Append `message` to both sinks.
    ///
    /// The two appends are independent: if one fails the other is still
    /// attempted, and failures only reach the diagnostic logger.
    pub async fn record(&self, peer: &str, timestamp: &str, message: &DecodedMessage) {
        let _guard = self.inner.write_lock.lock().await;

        if let Err(e) = self.write_log_line(peer, timestamp, message).await {
            self.logger.warn(&format!("❌ Log write error: {}", e));
        }
        if let Err(e) = self.write_csv_row(peer, timestamp, message).await {
            self.logger.warn(&format!("❌ CSV write error: {}", e));
        }
    }

    /// Append one line to the text log only.
    pub async fn append_log(
        &self,
        peer: &str,
        timestamp: &str,
        message: &DecodedMessage,
    ) -> Result<(), SinkError> {
        let _guard = self.inner.write_lock.lock().await;
        self.write_log_line(peer, timestamp, message).await
    }

    /// Append one row to the CSV table only, creating it with a header if needed.
    pub async fn append_csv(
        &self,
        peer: &str,
        timestamp: &str,
        message: &DecodedMessage,
    ) -> Result<(), SinkError> {
        let _guard = self.inner.write_lock.lock().await;
        self.write_csv_row(peer, timestamp, message).await
    }

    /// Take the write lock, stalling every append until the guard drops.
    #[cfg(test)]
    pub(crate) async fn stall_writes(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.write_lock.lock().await
    }

    // Callers must hold `write_lock`.
    async fn write_log_line(
        &self,
        peer: &str,
        timestamp: &str,
        message: &DecodedMessage,
    ) -> Result<(), SinkError> {
        let line = format_log_line(peer, timestamp, message);
        append(&self.inner.log_path, line.as_bytes()).await
    }

    // Callers must hold `write_lock`.
    async fn write_csv_row(
        &self,
        peer: &str,
        timestamp: &str,
        message: &DecodedMessage,
    ) -> Result<(), SinkError> {
        let path = &self.inner.csv_path;
        let mut data = String::new();

        // Treat "can't tell" as "missing"; the append below reports the real error
        if !fs::try_exists(path).await.unwrap_or(false) {
            data.push_str(CSV_HEADER);
        }
        data.push_str(&format_csv_row(peer, timestamp, message));

        append(path, data.as_bytes()).await
    }
}

/// Open `path` for append (creating it) and write `data` in one go.
async fn append(path: &Path, data: &[u8]) -> Result<(), SinkError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    let write_err = |source| SinkError::Write {
        path: path.to_path_buf(),
        source,
    };

    file.write_all(data).await.map_err(write_err)?;
    // tokio's File finishes the write in the background; wait for it
    file.flush().await.map_err(write_err)?;
    Ok(())
}

/// `<ISO-8601> - <peer> - <json-or-text>\n`
pub fn format_log_line(peer: &str, timestamp: &str, message: &DecodedMessage) -> String {
    format!("{} - {} - {}\n", timestamp, peer, message.log_payload())
}

/// `<ISO-8601>,<peer>,<celsius>,<fahrenheit>\n`
pub fn format_csv_row(peer: &str, timestamp: &str, message: &DecodedMessage) -> String {
    let (celsius, fahrenheit) = match message {
        DecodedMessage::Valid(JsonValue::Object(map)) => (
            map.get("celsius").map(csv_cell).unwrap_or_default(),
            map.get("fahrenheit").map(csv_cell).unwrap_or_default(),
        ),
        // Non-objects and unparsed text have nothing to put in the numeric columns
        _ => (String::new(), String::new()),
    };

    format!(
        "{},{},{},{}\n",
        escape_csv(timestamp),
        escape_csv(peer),
        escape_csv(&celsius),
        escape_csv(&fahrenheit)
    )
}

/// Render one JSON value as CSV cell text.
fn csv_cell(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Quote a cell when it contains a delimiter, quote or line break (RFC 4180).
fn escape_csv(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}
