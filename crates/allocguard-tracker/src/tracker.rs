//! Allocation tracker facade.
//!
//! Callers wrap a raw allocator with it:
//!
//! 1. `resize_for_canary(size)` tells them how much to ask the raw allocator
//!    for.
//! 2. `notify_alloc` records the raw block and returns the user pointer,
//!    offset past the head guard when guards are installed.
//! 3. `notify_free` validates and retires the record and returns the raw
//!    block to hand back to the raw allocator.
//!
//! Until [`AllocationTracker::init`] runs every call passes its input
//! through unchanged. Violations come back as [`TrackerError`] after being
//! logged; aborting is the caller's decision.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::canary;
use crate::config::{TrackerConfig, tracker_config};
use crate::error::TrackerError;
use crate::leak_report::LeakReport;
use crate::ledger::{AllocationRecord, AllocatorId, Ledger, LedgerTotals};
use crate::metrics::{MetricsSnapshot, TrackerMetrics};
use crate::ptr::{RawBlock, UserPtr};
use crate::structured_log::{LogEntry, LogLevel, LogSink, StderrSink};

/// Live-allocation tracker. One instance is shared by reference between all
/// callers of one raw allocator.
pub struct AllocationTracker {
    enabled: AtomicBool,
    canaries: AtomicBool,
    ledger: Ledger,
    metrics: TrackerMetrics,
    sink: Arc<dyn LogSink>,
}

impl AllocationTracker {
    /// A disabled tracker that logs to stderr.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sink(Arc::new(StderrSink))
    }

    /// A disabled tracker that logs to `sink`.
    #[must_use]
    pub fn with_sink(sink: Arc<dyn LogSink>) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            canaries: AtomicBool::new(false),
            ledger: Ledger::new(),
            metrics: TrackerMetrics::new(),
            sink,
        }
    }

    /// A tracker initialized per `config` (left disabled in `Off` mode).
    #[must_use]
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::with_config(config, Arc::new(StderrSink))
    }

    /// [`Self::from_config`] logging to `sink`.
    #[must_use]
    pub fn with_config(config: &TrackerConfig, sink: Arc<dyn LogSink>) -> Self {
        let tracker = Self::with_sink(sink);
        tracker.apply_config(config);
        tracker
    }

    /// Initialize per `config`; `Off` leaves the current state alone.
    pub fn apply_config(&self, config: &TrackerConfig) {
        if let Some(use_canaries) = config.mode.init_canaries() {
            self.init(use_canaries);
        }
    }

    /// Enable tracking with an empty ledger and zeroed counters.
    ///
    /// Meant to run once at start-up, before any tracked allocation. Running
    /// it again drops every live record along with the counters.
    pub fn init(&self, use_canaries: bool) {
        self.ledger.clear();
        self.metrics.reset();
        self.canaries.store(use_canaries, Ordering::Release);
        self.enabled.store(true, Ordering::Release);
        self.sink.emit(
            LogEntry::new(LogLevel::Info, "tracker_init")
                .with_details(serde_json::json!({ "use_canaries": use_canaries })),
        );
    }

    /// Forget every live record; mode flags stay as they are.
    ///
    /// Test utility only. Allocations still outstanding become untracked, so
    /// freeing them afterwards reports an unknown pointer.
    pub fn reset(&self) {
        let dropped = self.ledger.totals();
        self.ledger.clear();
        self.sink.emit(
            LogEntry::new(LogLevel::Debug, "tracker_reset").with_details(serde_json::json!({
                "dropped_allocations": dropped.live_count,
                "dropped_bytes": dropped.outstanding_bytes,
            })),
        );
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Whether guards are installed for allocations that ask for them.
    #[must_use]
    pub fn canaries_enabled(&self) -> bool {
        self.is_enabled() && self.canaries.load(Ordering::Acquire)
    }

    /// Size to request from the raw allocator for a `size`-byte allocation
    /// that will be passed to `notify_alloc` with `add_canary = true`.
    ///
    /// Saturates at `usize::MAX`, which no raw allocator can satisfy.
    #[must_use]
    pub fn resize_for_canary(&self, size: usize) -> usize {
        size.saturating_add(canary::overhead_for(size, self.canaries_enabled()))
    }

    /// Record a raw allocation made with [`AllocatorId::DEFAULT`].
    ///
    /// # Safety
    ///
    /// See [`Self::notify_alloc_block`].
    pub unsafe fn notify_alloc(
        &self,
        raw: Option<RawBlock>,
        requested_size: usize,
        add_canary: bool,
    ) -> Result<Option<UserPtr>, TrackerError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.notify_alloc_from(AllocatorId::DEFAULT, raw, requested_size, add_canary) }
    }

    /// Record a raw allocation. `None` (a null raw pointer) passes through.
    ///
    /// # Safety
    ///
    /// See [`Self::notify_alloc_block`].
    pub unsafe fn notify_alloc_from(
        &self,
        allocator: AllocatorId,
        raw: Option<RawBlock>,
        requested_size: usize,
        add_canary: bool,
    ) -> Result<Option<UserPtr>, TrackerError> {
        let Some(raw) = raw else {
            TrackerMetrics::inc(&self.metrics.null_passthroughs);
            return Ok(None);
        };
        // SAFETY: forwarded caller contract.
        unsafe { self.notify_alloc_block(allocator, raw, requested_size, add_canary) }.map(Some)
    }

    /// Record the non-null raw block `raw` and return the user pointer.
    ///
    /// # Safety
    ///
    /// When `add_canary` is true, `raw` must be valid for writes of
    /// `resize_for_canary(requested_size)` bytes and owned by the calling
    /// thread for the duration of the call.
    pub unsafe fn notify_alloc_block(
        &self,
        allocator: AllocatorId,
        raw: RawBlock,
        requested_size: usize,
        add_canary: bool,
    ) -> Result<UserPtr, TrackerError> {
        if !self.is_enabled() {
            TrackerMetrics::inc(&self.metrics.disabled_passthroughs);
            return Ok(UserPtr::unguarded(raw));
        }

        let canary_active = add_canary && self.canaries_enabled();
        let user = if canary_active {
            // SAFETY: the caller sized the block with resize_for_canary.
            unsafe {
                canary::install(raw, requested_size);
                canary::user_region(raw)
            }
        } else {
            UserPtr::unguarded(raw)
        };

        let record = AllocationRecord::new(user.addr(), requested_size, canary_active, allocator);
        if let Err(err) = self.ledger.insert(record) {
            TrackerMetrics::inc(&self.metrics.ledger_collisions);
            return Err(self.report(err));
        }
        TrackerMetrics::inc(&self.metrics.allocs_tracked);
        if canary_active {
            TrackerMetrics::inc(&self.metrics.canaries_installed);
        }
        Ok(user)
    }

    /// Retire an allocation made with [`AllocatorId::DEFAULT`].
    ///
    /// # Safety
    ///
    /// See [`Self::notify_free_block`].
    pub unsafe fn notify_free(
        &self,
        user: Option<UserPtr>,
    ) -> Result<Option<RawBlock>, TrackerError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.notify_free_from(AllocatorId::DEFAULT, user) }
    }

    /// Retire an allocation. `None` (a null user pointer) passes through.
    ///
    /// # Safety
    ///
    /// See [`Self::notify_free_block`].
    pub unsafe fn notify_free_from(
        &self,
        allocator: AllocatorId,
        user: Option<UserPtr>,
    ) -> Result<Option<RawBlock>, TrackerError> {
        let Some(user) = user else {
            TrackerMetrics::inc(&self.metrics.null_passthroughs);
            return Ok(None);
        };
        // SAFETY: forwarded caller contract.
        unsafe { self.notify_free_block(allocator, user) }.map(Some)
    }

    /// Remove the record for `user`, verify its guards if it has any, and
    /// return the raw block to release.
    ///
    /// On [`TrackerError::CanaryMismatch`] the record is already retired and
    /// the block must not be handed back to the raw allocator.
    ///
    /// # Safety
    ///
    /// If `user` is live in this tracker, its block must not have been
    /// released yet and must be owned by the calling thread for the call.
    pub unsafe fn notify_free_block(
        &self,
        allocator: AllocatorId,
        user: UserPtr,
    ) -> Result<RawBlock, TrackerError> {
        if !self.is_enabled() {
            TrackerMetrics::inc(&self.metrics.disabled_passthroughs);
            return Ok(RawBlock::unguarded(user));
        }

        let record = match self.ledger.take(user.addr(), allocator) {
            Ok(record) => record,
            Err(err) => {
                let counter = match err {
                    TrackerError::AllocatorMismatch { .. } => &self.metrics.allocator_mismatches,
                    _ => &self.metrics.unknown_frees,
                };
                TrackerMetrics::inc(counter);
                return Err(self.report(err));
            }
        };

        if !record.canary_active {
            TrackerMetrics::inc(&self.metrics.frees_tracked);
            return Ok(RawBlock::unguarded(user));
        }

        // SAFETY: canary_active records were built by canary::user_region, and
        // the caller still owns the block.
        let (raw, verdict) = unsafe {
            let raw = canary::raw_block(user);
            (raw, canary::verify(raw, record.requested_size))
        };
        if let Some(region) = verdict.failed_region() {
            TrackerMetrics::inc(&self.metrics.canary_failures);
            return Err(self.report(TrackerError::CanaryMismatch {
                addr: record.user_addr,
                requested_size: record.requested_size,
                region,
            }));
        }
        TrackerMetrics::inc(&self.metrics.canary_passes);
        TrackerMetrics::inc(&self.metrics.frees_tracked);
        Ok(raw)
    }

    /// Leak checkpoint: log every live record and return the outstanding
    /// byte counter.
    ///
    /// Does not clear the ledger. A non-zero result is a defect to report,
    /// not a fatal error. Records are only copied out when some are live.
    pub fn expect_no_allocations(&self) -> usize {
        TrackerMetrics::inc(&self.metrics.leak_checks);
        let totals = self.ledger.totals();
        let report = if totals.live_count == 0 {
            LeakReport::default()
        } else {
            self.leak_report()
        };
        report.log_to(self.sink.as_ref());
        totals.outstanding_bytes
    }

    /// Live records in allocation order, without logging.
    #[must_use]
    pub fn leak_report(&self) -> LeakReport {
        LeakReport::from_records(self.ledger.snapshot())
    }

    /// Live record for a user pointer, if any.
    #[must_use]
    pub fn record_for(&self, user: UserPtr) -> Option<AllocationRecord> {
        self.ledger.get(user.addr())
    }

    #[must_use]
    pub fn outstanding_bytes(&self) -> usize {
        self.ledger.outstanding_bytes()
    }

    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.ledger.len()
    }

    #[must_use]
    pub fn totals(&self) -> LedgerTotals {
        self.ledger.totals()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn report(&self, err: TrackerError) -> TrackerError {
        self.sink.emit(err.to_log_entry());
        err
    }
}

impl Default for AllocationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AllocationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationTracker")
            .field("enabled", &self.is_enabled())
            .field("canaries", &self.canaries_enabled())
            .field("totals", &self.ledger.totals())
            .finish_non_exhaustive()
    }
}

static GLOBAL_TRACKER: OnceLock<AllocationTracker> = OnceLock::new();

/// Process-wide tracker, initialized from [`tracker_config`] on first use.
///
/// Under `ALLOCGUARD_MODE=off` it stays disabled until `init` is called.
#[must_use]
pub fn global_tracker() -> &'static AllocationTracker {
    GLOBAL_TRACKER.get_or_init(|| AllocationTracker::from_config(&tracker_config()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canary::{GUARD_OVERHEAD, GuardRegion, HEAD_GUARD_LEN};
    use crate::structured_log::MemorySink;

    fn tracker() -> (AllocationTracker, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (AllocationTracker::with_sink(sink.clone()), sink)
    }

    fn raw_of(buf: &mut [u8]) -> RawBlock {
        RawBlock::new(buf.as_mut_ptr()).unwrap()
    }

    #[test]
    fn uninitialized_tracker_passes_everything_through() {
        let (t, sink) = tracker();
        let mut buf = vec![0_u8; 100];
        let raw = raw_of(&mut buf);

        assert_eq!(t.resize_for_canary(100), 100);
        // SAFETY: buf outlives the calls; nothing is written while disabled.
        let user = unsafe { t.notify_alloc(Some(raw), 100, true) }.unwrap().unwrap();
        assert_eq!(user.addr(), raw.addr());
        // SAFETY: as above.
        let back = unsafe { t.notify_free(Some(user)) }.unwrap().unwrap();
        assert_eq!(back, raw);
        assert!(buf.iter().all(|b| *b == 0));
        assert_eq!(t.expect_no_allocations(), 0);
        assert_eq!(t.metrics().disabled_passthroughs, 2);
        assert!(!sink.events().contains(&"tracker_init".to_string()));
    }

    #[test]
    fn resize_adds_constant_overhead_only_with_canaries() {
        let (t, _) = tracker();
        t.init(false);
        assert_eq!(t.resize_for_canary(64), 64);
        t.init(true);
        for size in [0, 1, 64, 1000] {
            assert_eq!(t.resize_for_canary(size), size + GUARD_OVERHEAD);
        }
        assert_eq!(t.resize_for_canary(usize::MAX), usize::MAX);
    }

    #[test]
    fn canary_round_trip_returns_the_raw_block() {
        let (t, _) = tracker();
        t.init(true);
        let mut buf = vec![0_u8; t.resize_for_canary(64)];
        let raw = raw_of(&mut buf);

        // SAFETY: buf was sized with resize_for_canary.
        let user = unsafe { t.notify_alloc(Some(raw), 64, true) }.unwrap().unwrap();
        assert_eq!(user.addr(), raw.addr() + HEAD_GUARD_LEN);
        assert_eq!(t.expect_no_allocations(), 64);
        assert!(t.record_for(user).unwrap().canary_active);

        // SAFETY: user is live and buf is still allocated.
        let back = unsafe { t.notify_free(Some(user)) }.unwrap().unwrap();
        assert_eq!(back, raw);
        assert_eq!(t.expect_no_allocations(), 0);

        let m = t.metrics();
        assert_eq!(m.canaries_installed, 1);
        assert_eq!(m.canary_passes, 1);
        assert_eq!(m.leak_checks, 2);
    }

    #[test]
    fn add_canary_false_skips_guards_even_when_enabled() {
        let (t, _) = tracker();
        t.init(true);
        let mut buf = vec![0_u8; 32];
        let raw = raw_of(&mut buf);
        // SAFETY: no guards are written for add_canary = false.
        let user = unsafe { t.notify_alloc(Some(raw), 32, false) }.unwrap().unwrap();
        assert_eq!(user.addr(), raw.addr());
        assert!(!t.record_for(user).unwrap().canary_active);
        // SAFETY: user is live.
        assert_eq!(unsafe { t.notify_free(Some(user)) }.unwrap(), Some(raw));
    }

    #[test]
    fn null_is_propagated_without_state_change() {
        let (t, _) = tracker();
        t.init(true);
        // SAFETY: null pointers are never dereferenced.
        unsafe {
            assert_eq!(t.notify_alloc(None, 4096, true).unwrap(), None);
            assert_eq!(t.notify_free(None).unwrap(), None);
        }
        assert_eq!(t.live_allocations(), 0);
        assert_eq!(t.outstanding_bytes(), 0);
        assert_eq!(t.metrics().null_passthroughs, 2);
    }

    #[test]
    fn double_free_is_unknown_pointer() {
        let (t, sink) = tracker();
        t.init(false);
        let mut buf = vec![0_u8; 8];
        let raw = raw_of(&mut buf);
        // SAFETY: buf outlives the calls.
        unsafe {
            let user = t.notify_alloc(Some(raw), 8, true).unwrap();
            t.notify_free(user).unwrap();
            let err = t.notify_free(user).unwrap_err();
            assert_eq!(err, TrackerError::UnknownPointer { addr: raw.addr() });
        }
        assert_eq!(t.metrics().unknown_frees, 1);
        assert_eq!(sink.events().last().unwrap(), "unknown_pointer_free");
    }

    #[test]
    fn tail_overrun_is_canary_mismatch() {
        let (t, sink) = tracker();
        t.init(true);
        let mut buf = vec![0_u8; t.resize_for_canary(10)];
        let raw = raw_of(&mut buf);
        // SAFETY: buf was sized with resize_for_canary.
        let user = unsafe { t.notify_alloc(Some(raw), 10, true) }.unwrap();
        // SAFETY: the first tail guard byte lies inside buf.
        unsafe { raw.as_ptr().add(HEAD_GUARD_LEN + 10).write(b'!') };
        // SAFETY: user is live and buf is still allocated.
        let err = unsafe { t.notify_free(user) }.unwrap_err();
        assert_eq!(
            err,
            TrackerError::CanaryMismatch {
                addr: raw.addr() + HEAD_GUARD_LEN,
                requested_size: 10,
                region: GuardRegion::Tail,
            }
        );
        assert_eq!(t.metrics().canary_failures, 1);
        let last = sink.entries().pop().unwrap();
        assert_eq!(last.level, LogLevel::Fatal);
        assert_eq!(last.region, Some(GuardRegion::Tail));
        assert_eq!(t.live_allocations(), 0);
    }

    #[test]
    fn reset_forgets_records_but_keeps_mode() {
        let (t, _) = tracker();
        t.init(true);
        let mut buf = vec![0_u8; t.resize_for_canary(16)];
        let raw = raw_of(&mut buf);
        // SAFETY: buf was sized with resize_for_canary.
        let user = unsafe { t.notify_alloc(Some(raw), 16, true) }.unwrap();
        t.reset();
        assert!(t.is_enabled());
        assert!(t.canaries_enabled());
        assert_eq!(t.expect_no_allocations(), 0);
        // SAFETY: the pointer is no longer live, so memory is not touched.
        assert!(matches!(
            unsafe { t.notify_free(user) },
            Err(TrackerError::UnknownPointer { .. })
        ));
    }

    #[test]
    fn leak_report_lists_records_in_allocation_order() {
        let (t, sink) = tracker();
        t.init(false);
        let mut bufs = [[0_u8; 4]; 3];
        let mut users = Vec::new();
        for (i, buf) in bufs.iter_mut().enumerate() {
            let raw = raw_of(buf);
            // SAFETY: no guards are written with canaries disabled.
            users.push(unsafe { t.notify_alloc(Some(raw), i + 1, true) }.unwrap().unwrap());
        }
        let report = t.leak_report();
        let addrs: Vec<usize> = report.leaks.iter().map(|r| r.user_addr).collect();
        assert_eq!(addrs, users.iter().map(|u| u.addr()).collect::<Vec<_>>());
        assert_eq!(t.expect_no_allocations(), 6);
        assert_eq!(
            sink.events().iter().filter(|e| *e == "leaked_allocation").count(),
            3
        );
        assert_eq!(t.live_allocations(), 3);
    }

    #[test]
    fn global_tracker_is_one_instance_set_up_from_the_environment() {
        let global = global_tracker();
        assert!(std::ptr::eq(global, global_tracker()));
        let mode = tracker_config().mode;
        assert_eq!(global.is_enabled(), mode.init_canaries().is_some());
        assert_eq!(global.canaries_enabled(), mode.init_canaries() == Some(true));
    }

    #[test]
    fn leak_checkpoint_returns_the_running_counter() {
        let (t, sink) = tracker();
        t.init(false);
        assert_eq!(t.expect_no_allocations(), 0);
        assert_eq!(sink.events(), vec!["tracker_init", "leak_check"]);

        let mut buf = vec![0_u8; 12];
        let raw = raw_of(&mut buf);
        // SAFETY: no guards are written with canaries disabled.
        let user = unsafe { t.notify_alloc(Some(raw), 12, true) }.unwrap();
        assert_eq!(t.expect_no_allocations(), t.outstanding_bytes());
        assert_eq!(t.expect_no_allocations(), 12);
        // SAFETY: user is live.
        unsafe { t.notify_free(user) }.unwrap();
        assert_eq!(t.expect_no_allocations(), 0);
    }

    #[test]
    fn config_off_leaves_tracker_disabled() {
        let off = TrackerConfig {
            mode: crate::config::TrackerMode::Off,
            ..TrackerConfig::default()
        };
        assert!(!AllocationTracker::from_config(&off).is_enabled());
        let tracker = AllocationTracker::from_config(&TrackerConfig::default());
        assert!(tracker.canaries_enabled());
        let tracking = TrackerConfig {
            mode: crate::config::TrackerMode::Tracking,
            ..TrackerConfig::default()
        };
        let tracker = AllocationTracker::with_config(&tracking, Arc::new(MemorySink::new()));
        assert!(tracker.is_enabled() && !tracker.canaries_enabled());
    }
}
