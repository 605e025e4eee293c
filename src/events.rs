//! Append-only execution log, one JSON record per line.
//!
//! Each run gets `{log_dir}/{workflow_id}.jsonl`. Records are flushed as they
//! are appended so an interrupted run still leaves a complete trail. Log I/O
//! failures are reported as warnings and never fail the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;

/// Severity of a log record, ordered most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Information,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LogLevel::Critical => "CRITICAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Information => "INFO",
        };
        write!(f, "{label}")
    }
}

/// One line of the execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Handle to a run's log file. Cheap to clone; all clones share the writer.
#[derive(Clone)]
pub struct ExecutionLog {
    writer: Arc<Mutex<Option<BufWriter<File>>>>,
    path: Option<PathBuf>,
}

impl ExecutionLog {
    /// Open (or create) the log file for a run, appending to any prior content.
    pub async fn create(log_dir: &Path, workflow_id: &str) -> Result<Self> {
        fs::create_dir_all(log_dir).await?;
        let path = log_dir.join(format!("{workflow_id}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            writer: Arc::new(Mutex::new(Some(BufWriter::new(file)))),
            path: Some(path),
        })
    }

    /// A log that discards everything. Used when no log directory is configured.
    pub fn disabled() -> Self {
        Self {
            writer: Arc::new(Mutex::new(None)),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn append(&self, record: LogRecord) {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return;
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize log record: {e}");
                return;
            }
        };
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to write execution log: {e}");
        }
    }

    pub async fn record(
        &self,
        level: LogLevel,
        step: Option<&str>,
        message: impl Into<String>,
        context: Option<Value>,
    ) {
        self.append(LogRecord {
            timestamp: Utc::now(),
            level,
            step: step.map(str::to_string),
            message: message.into(),
            context,
        })
        .await;
    }

    pub async fn information(&self, step: Option<&str>, message: impl Into<String>) {
        self.record(LogLevel::Information, step, message, None).await;
    }

    pub async fn warning(&self, step: Option<&str>, message: impl Into<String>) {
        self.record(LogLevel::Warning, step, message, None).await;
    }

    pub async fn error(&self, step: Option<&str>, message: impl Into<String>) {
        self.record(LogLevel::Error, step, message, None).await;
    }

    pub async fn critical(&self, step: Option<&str>, message: impl Into<String>) {
        self.record(LogLevel::Critical, step, message, None).await;
    }
}

/// Read every record from a log file, oldest first. Lines that fail to parse
/// are skipped with a warning rather than aborting the read.
pub async fn read_records(path: &Path) -> Result<Vec<LogRecord>> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping malformed log line: {e}"),
        }
    }
    Ok(records)
}
