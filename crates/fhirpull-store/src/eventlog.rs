//! Append-only structured event log, one JSON object per line.
//!
//! Every sub-export carries a `log.ndjson` capturing warnings and failures
//! with enough context to audit a run after the fact. The log is
//! single-writer and line-flushed; terminal tracing output is separate.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use fhirpull_core::FhirInstant;

use crate::error::{Result, StoreError};

pub const LOG_FILE: &str = "log.ndjson";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A structured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub ts: FhirInstant,
    pub level: LogLevel,
    /// Which stage emitted the event: `bulk`, `crawl`, `cohort`,
    /// `hydrate`, `workspace`.
    pub phase: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

impl LogEvent {
    pub fn new(level: LogLevel, phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ts: fhirpull_core::now_utc(),
            level,
            phase: phase.into(),
            message: message.into(),
            resource_type: None,
            patient_id: None,
            url: None,
            http_status: None,
        }
    }

    pub fn info(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, phase, message)
    }

    pub fn warn(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, phase, message)
    }

    pub fn error(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, phase, message)
    }

    pub fn resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn patient_id(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }
}

/// Single-writer handle on a sub-export's `log.ndjson`.
pub struct EventLog {
    file: Mutex<File>,
}

impl EventLog {
    /// Open (appending) or create the log in the given sub-export
    /// directory.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one event and flush the line.
    pub fn append(&self, event: &LogEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        file.write_all(&line)
            .and_then(|()| file.flush())
            .map_err(|e| StoreError::io(LOG_FILE, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_reread() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        log.append(
            &LogEvent::warn("crawl", "query failed after retries")
                .resource_type("Observation")
                .patient_id("p1")
                .http_status(500),
        )
        .unwrap();
        log.append(&LogEvent::info("bulk", "manifest received")).unwrap();

        let contents = std::fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: LogEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.level, LogLevel::Warn);
        assert_eq!(first.patient_id.as_deref(), Some("p1"));
        assert_eq!(first.http_status, Some(500));

        let second: LogEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.level, LogLevel::Info);
        assert!(second.patient_id.is_none());
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = EventLog::open(dir.path()).unwrap();
            log.append(&LogEvent::info("workspace", "run started")).unwrap();
        }
        {
            let log = EventLog::open(dir.path()).unwrap();
            log.append(&LogEvent::info("workspace", "run resumed")).unwrap();
        }
        let contents = std::fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
