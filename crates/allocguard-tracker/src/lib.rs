//! Live-allocation tracker with optional guard canaries.
//!
//! Sits between callers and a raw allocator. Every tracked block is recorded
//! in a ledger keyed by the address the caller sees; frees are checked
//! against it, guard regions are verified on the way out, and a leak
//! checkpoint reports whatever is still live.
//!
//! # Architecture
//!
//! - **Typed pointers** (`ptr`): raw block vs user pointer, never mixed up
//! - **Canaries** (`canary`): guard layout, install and verify
//! - **Ledger** (`ledger`): lock-protected map of live records
//! - **Tracker** (`tracker`): the notify / resize / leak-check facade
//! - **Raw allocators** (`raw_alloc`): the C heap wrapped in a tracked allocator
//! - **Leak reports** (`leak_report`): checkpoint output
//! - **Configuration** (`config`): mode and violation policy from the environment
//! - **Metrics** (`metrics`): atomic counters for observability
//! - **Structured logs** (`structured_log`): JSONL event sinks

#![deny(unsafe_code)]

pub mod canary;
pub mod config;
pub mod error;
pub mod leak_report;
pub mod ledger;
pub mod metrics;
pub mod ptr;
pub mod raw_alloc;
pub mod structured_log;
pub mod tracker;

pub use canary::GuardRegion;
pub use config::{TrackerConfig, TrackerMode, ViolationPolicy, tracker_config};
pub use error::{AllocError, TrackerError};
pub use leak_report::LeakReport;
pub use ledger::{AllocationRecord, AllocatorId, LedgerTotals};
pub use metrics::{MetricsSnapshot, TrackerMetrics};
pub use ptr::{RawBlock, UserPtr};
pub use raw_alloc::{LibcRaw, RawAllocator, TrackedAllocator};
pub use structured_log::{LogEntry, LogLevel, LogSink, MemorySink, NullSink, StderrSink};
pub use tracker::{AllocationTracker, global_tracker};
