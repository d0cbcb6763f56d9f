//! Seeded concurrent alloc/free pressure on one shared tracker.
//!
//! Each worker owns a [`TrackedAllocator`] with its own [`AllocatorId`],
//! fills every block with a per-worker byte and checks it before freeing.

#![allow(unsafe_code)]

use std::sync::Arc;
use std::thread;

use allocguard_tracker::{
    AllocationTracker, AllocatorId, LedgerTotals, LibcRaw, LogSink, MetricsSnapshot,
    TrackedAllocator, TrackerConfig, TrackerMode, UserPtr, ViolationPolicy,
};
use serde::Serialize;

use crate::HarnessError;

/// Largest request a worker makes.
pub const MAX_BLOCK: usize = 1024;
/// Blocks a worker holds at most.
pub const MAX_HELD: usize = 64;

#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    /// Zero is remapped; xorshift never leaves the zero state.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StressConfig {
    pub threads: u8,
    pub ops: usize,
    pub seed: u64,
    pub mode: TrackerMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub config: StressConfig,
    pub metrics: MetricsSnapshot,
    pub totals: LedgerTotals,
    pub leaked_bytes: usize,
    pub passed: bool,
}

struct Held {
    user: UserPtr,
    len: usize,
}

fn run_worker(
    worker: usize,
    alloc: &TrackedAllocator<'_>,
    mut rng: XorShift64,
    ops: usize,
) -> Result<(), HarnessError> {
    let fill = (worker as u8).wrapping_mul(0x3B) | 1;
    let mut held: Vec<Held> = Vec::with_capacity(MAX_HELD);

    let release = |block: Held| -> Result<(), HarnessError> {
        // SAFETY: held blocks are live and owned by this worker.
        let bytes = unsafe { std::slice::from_raw_parts(block.user.as_ptr(), block.len) };
        if let Some(found) = bytes.iter().copied().find(|b| *b != fill) {
            return Err(HarnessError::PayloadCorrupted {
                worker,
                expected: fill,
                found,
            });
        }
        // SAFETY: as above; the block is not touched afterwards.
        unsafe { alloc.free(Some(block.user)) }?;
        Ok(())
    };

    for _ in 0..ops {
        let grow = held.is_empty() || (held.len() < MAX_HELD && rng.next_u64() % 3 != 0);
        if grow {
            let len = rng.gen_range_usize(0, MAX_BLOCK);
            let user = alloc.alloc(len)?;
            // SAFETY: the fresh user region holds `len` bytes.
            unsafe { user.as_ptr().write_bytes(fill, len) };
            held.push(Held { user, len });
        } else {
            let index = rng.gen_range_usize(0, held.len() - 1);
            release(held.swap_remove(index))?;
        }
    }
    for block in held.drain(..) {
        release(block)?;
    }
    Ok(())
}

/// Run the workers to completion, then take the leak checkpoint.
pub fn run_stress(
    config: StressConfig,
    sink: Arc<dyn LogSink>,
) -> Result<StressReport, HarnessError> {
    let tracker_config = TrackerConfig {
        mode: config.mode,
        ..TrackerConfig::default()
    };
    let tracker = AllocationTracker::with_config(&tracker_config, sink);

    let mut seeder = XorShift64::new(config.seed);
    let seeds: Vec<u64> = (0..config.threads).map(|_| seeder.next_u64()).collect();

    thread::scope(|scope| {
        let handles: Vec<_> = seeds
            .iter()
            .enumerate()
            .zip(0..=u8::MAX)
            .map(|((worker, seed), id)| {
                let tracker = &tracker;
                let rng = XorShift64::new(*seed);
                scope.spawn(move || {
                    let alloc = TrackedAllocator::with_raw(tracker, LibcRaw, AllocatorId(id))
                        .on_violation(ViolationPolicy::Report);
                    run_worker(worker, &alloc, rng, config.ops)
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .try_for_each(|(worker, handle)| {
                handle
                    .join()
                    .map_err(|_| HarnessError::WorkerPanicked { worker })?
            })
    })?;

    let leaked_bytes = tracker.expect_no_allocations();
    let metrics = tracker.metrics();
    let passed = leaked_bytes == 0
        && metrics.allocs_tracked == metrics.frees_tracked
        && metrics.canary_failures == 0;
    Ok(StressReport {
        config,
        metrics,
        totals: tracker.totals(),
        leaked_bytes,
        passed,
    })
}
