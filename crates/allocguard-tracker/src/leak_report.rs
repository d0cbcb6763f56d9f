//! Leak checkpoint output.

use std::fmt;

use serde::Serialize;

use crate::ledger::AllocationRecord;
use crate::structured_log::{LogEntry, LogLevel, LogSink};

/// Records still live at a leak checkpoint, in allocation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    pub leaks: Vec<AllocationRecord>,
    pub total_bytes: usize,
}

impl LeakReport {
    #[must_use]
    pub fn from_records(leaks: Vec<AllocationRecord>) -> Self {
        let total_bytes = leaks
            .iter()
            .fold(0_usize, |acc, record| acc.saturating_add(record.requested_size));
        Self { leaks, total_bytes }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.leaks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.leaks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaks.is_empty()
    }

    /// One `leaked_allocation` entry per record, then a `leak_check` summary.
    pub fn log_to(&self, sink: &dyn LogSink) {
        for record in &self.leaks {
            sink.emit(
                LogEntry::new(LogLevel::Warn, "leaked_allocation")
                    .with_addr(record.user_addr)
                    .with_size(record.requested_size)
                    .with_allocator(record.allocator.0),
            );
        }
        let level = if self.is_clean() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        sink.emit(LogEntry::new(level, "leak_check").with_details(serde_json::json!({
            "leaked_allocations": self.leaks.len(),
            "leaked_bytes": self.total_bytes,
        })));
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.leaks {
            writeln!(
                f,
                "found unfreed allocation. address: {:#x} size: {} bytes",
                record.user_addr, record.requested_size
            )?;
        }
        write!(
            f,
            "{} unfreed allocation(s), {} bytes outstanding",
            self.leaks.len(),
            self.total_bytes
        )
    }
}
