//! Structured JSONL diagnostics for the tracker.
//!
//! Provides:
//! - [`LogEntry`]: one JSON record per tracker event.
//! - [`LogSink`]: where entries go. [`StderrSink`] writes one line per entry,
//!   [`MemorySink`] keeps them for inspection, [`NullSink`] drops them.
//!
//! Entries are built and emitted after the ledger lock is released.

use std::io::Write;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::canary::GuardRegion;
use crate::error::TrackerError;

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `level`, `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub event: String,

    /// User address as `0x…`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<GuardRegion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocator: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            level,
            event: event.into(),
            addr: None,
            requested_size: None,
            region: None,
            allocator: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_addr(mut self, addr: usize) -> Self {
        self.addr = Some(format!("{addr:#x}"));
        self
    }

    #[must_use]
    pub fn with_size(mut self, requested_size: usize) -> Self {
        self.requested_size = Some(requested_size);
        self
    }

    #[must_use]
    pub fn with_region(mut self, region: GuardRegion) -> Self {
        self.region = Some(region);
        self
    }

    #[must_use]
    pub fn with_allocator(mut self, allocator: u8) -> Self {
        self.allocator = Some(allocator);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl TrackerError {
    /// Fatal-level entry describing this violation.
    #[must_use]
    pub fn to_log_entry(&self) -> LogEntry {
        let entry = LogEntry::new(LogLevel::Fatal, self.event())
            .with_addr(self.addr())
            .with_details(serde_json::json!({ "message": self.to_string() }));
        match *self {
            Self::UnknownPointer { .. } => entry,
            Self::LedgerCollision {
                existing_size,
                requested_size,
                ..
            } => entry
                .with_size(requested_size)
                .with_details(serde_json::json!({
                    "message": self.to_string(),
                    "existing_size": existing_size,
                })),
            Self::CanaryMismatch {
                requested_size,
                region,
                ..
            } => entry.with_size(requested_size).with_region(region),
            Self::AllocatorMismatch {
                expected, actual, ..
            } => entry
                .with_allocator(actual.0)
                .with_details(serde_json::json!({
                    "message": self.to_string(),
                    "expected_allocator": expected.0,
                })),
        }
    }
}

/// Destination for tracker log entries.
pub trait LogSink: Send + Sync {
    fn emit(&self, entry: LogEntry);
}

/// Writes each entry as one JSON line on stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrSink;

impl LogSink for StderrSink {
    fn emit(&self, entry: LogEntry) {
        let Ok(line) = entry.to_jsonl() else {
            return;
        };
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{line}");
    }
}

/// Drops every entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn emit(&self, _entry: LogEntry) {}
}

/// Keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Event names in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|entry| entry.event.clone())
            .collect()
    }

    /// Entries as JSONL text, one line per entry.
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for entry in self.entries.lock().iter() {
            out.push_str(&entry.to_jsonl()?);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl LogSink for MemorySink {
    fn emit(&self, entry: LogEntry) {
        self.entries.lock().push(entry);
    }
}

fn now_utc() -> String {
    let elapsed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = elapsed.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        elapsed.subsec_millis(),
    )
}

/// Proleptic Gregorian date for a count of days since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
