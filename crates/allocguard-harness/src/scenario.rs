//! Single-threaded walk through the tracker contract on a private tracker.

#![allow(unsafe_code)]

use std::sync::Arc;

use allocguard_tracker::canary::{self, TAIL_PATTERN};
use allocguard_tracker::{
    AllocError, AllocationTracker, AllocatorId, GuardRegion, LibcRaw, LogSink, MetricsSnapshot,
    RawAllocator, TrackerConfig, TrackerError, TrackerMode,
};
use serde::Serialize;

use crate::HarnessError;

/// Requested size used by every step.
pub const SCENARIO_SIZE: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub mode: TrackerMode,
    pub use_canaries: bool,
    pub requested_size: usize,
    pub resized: usize,
    pub checks: Vec<ScenarioCheck>,
    pub metrics: MetricsSnapshot,
    pub passed: bool,
}

impl ScenarioReport {
    pub fn failures(&self) -> impl Iterator<Item = &ScenarioCheck> {
        self.checks.iter().filter(|check| !check.passed)
    }
}

fn check(
    checks: &mut Vec<ScenarioCheck>,
    name: &'static str,
    passed: bool,
    detail: impl Into<String>,
) {
    checks.push(ScenarioCheck {
        name,
        passed,
        detail: detail.into(),
    });
}

/// Run the round trip and the error paths against a fresh tracker set up
/// for `mode`.
///
/// Tracker errors on the expected paths become checks; anything else is
/// returned as an error. Under `Off` only the passthrough contract is
/// checked.
pub fn run_scenario(
    mode: TrackerMode,
    sink: Arc<dyn LogSink>,
) -> Result<ScenarioReport, HarnessError> {
    let config = TrackerConfig {
        mode,
        ..TrackerConfig::default()
    };
    let tracker = AllocationTracker::with_config(&config, sink);
    let enabled = mode.init_canaries().is_some();
    let use_canaries = mode.init_canaries() == Some(true);
    let heap = LibcRaw;
    let mut checks = Vec::new();

    let resized = tracker.resize_for_canary(SCENARIO_SIZE);
    let expected = SCENARIO_SIZE + canary::overhead_for(SCENARIO_SIZE, use_canaries);
    check(
        &mut checks,
        "resize_for_canary",
        resized == expected,
        format!("expected {expected}, got {resized}"),
    );

    let raw = heap
        .allocate(resized)
        .ok_or(AllocError::OutOfMemory { size: resized })?;
    // SAFETY: raw is a fresh block of `resized` bytes.
    let user =
        unsafe { tracker.notify_alloc_block(AllocatorId::DEFAULT, raw, SCENARIO_SIZE, true) }?;
    let offset = user.addr() - raw.addr();
    let expected_offset = if use_canaries {
        canary::HEAD_GUARD_LEN
    } else {
        0
    };
    check(
        &mut checks,
        "user_offset",
        offset == expected_offset,
        format!("expected {expected_offset}, got {offset}"),
    );

    let live = tracker.expect_no_allocations();
    let expected_live = if enabled { SCENARIO_SIZE } else { 0 };
    check(
        &mut checks,
        "outstanding_after_alloc",
        live == expected_live,
        format!("expected {expected_live}, got {live}"),
    );

    // SAFETY: user is live and its block is still allocated.
    let back = unsafe { tracker.notify_free(Some(user)) }?;
    check(
        &mut checks,
        "round_trip",
        back == Some(raw),
        format!("expected {raw:?}, got {back:?}"),
    );
    if let Some(block) = back {
        // SAFETY: the tracker handed back the block from heap.allocate.
        unsafe { heap.release(block) };
    }

    let live = tracker.expect_no_allocations();
    check(
        &mut checks,
        "outstanding_after_free",
        live == 0,
        format!("expected 0, got {live}"),
    );

    if enabled {
        // SAFETY: the address is no longer live, so the tracker does not touch it.
        let second = unsafe { tracker.notify_free(Some(user)) };
        check(
            &mut checks,
            "double_free_detected",
            matches!(second, Err(TrackerError::UnknownPointer { .. })),
            format!("{second:?}"),
        );
    }

    let before = tracker.totals();
    // SAFETY: null is never dereferenced.
    let null = unsafe { tracker.notify_alloc(None, SCENARIO_SIZE, true) }?;
    check(
        &mut checks,
        "null_passthrough",
        null.is_none() && tracker.totals() == before,
        format!("{null:?}"),
    );

    if use_canaries {
        let raw = heap
            .allocate(resized)
            .ok_or(AllocError::OutOfMemory { size: resized })?;
        // SAFETY: raw is a fresh block of `resized` bytes, and the byte past
        // the user region is the first tail guard byte.
        let freed = unsafe {
            let user =
                tracker.notify_alloc_block(AllocatorId::DEFAULT, raw, SCENARIO_SIZE, true)?;
            user.as_ptr().add(SCENARIO_SIZE).write(!TAIL_PATTERN[0]);
            tracker.notify_free(Some(user))
        };
        // A block with a failed guard is never released.
        check(
            &mut checks,
            "tail_overrun_detected",
            matches!(
                freed,
                Err(TrackerError::CanaryMismatch {
                    region: GuardRegion::Tail,
                    ..
                })
            ),
            format!("{freed:?}"),
        );
    }

    let passed = checks.iter().all(|c| c.passed);
    Ok(ScenarioReport {
        mode,
        use_canaries,
        requested_size: SCENARIO_SIZE,
        resized,
        checks,
        metrics: tracker.metrics(),
        passed,
    })
}
