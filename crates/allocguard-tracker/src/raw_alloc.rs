//! Raw allocator seam and the tracked allocator built on it.
//!
//! [`TrackedAllocator`] runs the resize / allocate / notify sequence on one
//! side and notify / release on the other, so callers never see a raw block.
//! Blocks whose guards failed verification are never released.

#![allow(unsafe_code)]

use crate::canary::GUARD_OVERHEAD;
use crate::config::{ViolationPolicy, tracker_config};
use crate::error::{AllocError, TrackerError};
use crate::ledger::AllocatorId;
use crate::ptr::{RawBlock, UserPtr};
use crate::tracker::AllocationTracker;

/// Largest user request accepted by [`TrackedAllocator`].
pub const MAX_REQUEST: usize = isize::MAX as usize - GUARD_OVERHEAD;

/// Source of raw blocks.
///
/// # Safety
///
/// A block returned by `allocate(size)` must be valid for reads and writes of
/// `size` bytes, aligned for any primitive type, and not overlap any other
/// live block until it is passed to `release`.
pub unsafe trait RawAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Option<RawBlock>;

    /// # Safety
    ///
    /// `block` must come from `allocate` on this allocator and not have been
    /// released already.
    unsafe fn release(&self, block: RawBlock);
}

/// The C heap.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibcRaw;

// SAFETY: malloc returns max-aligned, non-overlapping blocks of at least the
// requested size.
unsafe impl RawAllocator for LibcRaw {
    fn allocate(&self, size: usize) -> Option<RawBlock> {
        // SAFETY: malloc has no preconditions; zero is bumped to one byte.
        RawBlock::new(unsafe { libc::malloc(size.max(1)) }.cast())
    }

    unsafe fn release(&self, block: RawBlock) {
        // SAFETY: block came from malloc above.
        unsafe { libc::free(block.as_ptr().cast()) }
    }
}

/// Allocator that reports every block to an [`AllocationTracker`].
#[derive(Debug)]
pub struct TrackedAllocator<'t, R: RawAllocator = LibcRaw> {
    tracker: &'t AllocationTracker,
    raw: R,
    id: AllocatorId,
    on_violation: ViolationPolicy,
}

impl<'t> TrackedAllocator<'t, LibcRaw> {
    /// C-heap allocator with the default id and the configured policy.
    #[must_use]
    pub fn new(tracker: &'t AllocationTracker) -> Self {
        Self::with_raw(tracker, LibcRaw, AllocatorId::DEFAULT)
    }
}

impl<'t, R: RawAllocator> TrackedAllocator<'t, R> {
    #[must_use]
    pub fn with_raw(tracker: &'t AllocationTracker, raw: R, id: AllocatorId) -> Self {
        Self {
            tracker,
            raw,
            id,
            on_violation: tracker_config().on_violation,
        }
    }

    #[must_use]
    pub fn on_violation(mut self, policy: ViolationPolicy) -> Self {
        self.on_violation = policy;
        self
    }

    #[must_use]
    pub fn id(&self) -> AllocatorId {
        self.id
    }

    #[must_use]
    pub fn tracker(&self) -> &'t AllocationTracker {
        self.tracker
    }

    /// Allocate `size` bytes with guards when the tracker has them enabled.
    pub fn alloc(&self, size: usize) -> Result<UserPtr, AllocError> {
        if size > MAX_REQUEST {
            return Err(AllocError::SizeOverflow { requested: size });
        }
        let real_size = self.tracker.resize_for_canary(size);
        let raw = self
            .raw
            .allocate(real_size)
            .ok_or(AllocError::OutOfMemory { size: real_size })?;
        // SAFETY: raw is a fresh block of real_size bytes.
        unsafe { self.tracker.notify_alloc_block(self.id, raw, size, true) }
            .map_err(|err| self.violation(err))
    }

    /// Allocate `size` zeroed bytes.
    pub fn alloc_zeroed(&self, size: usize) -> Result<UserPtr, AllocError> {
        let user = self.alloc(size)?;
        // SAFETY: the user region of a fresh allocation is `size` bytes.
        unsafe { user.as_ptr().write_bytes(0, size) };
        Ok(user)
    }

    /// Tracked copy of `bytes`.
    pub fn dup_bytes(&self, bytes: &[u8]) -> Result<UserPtr, AllocError> {
        let user = self.alloc(bytes.len())?;
        // SAFETY: the fresh user region holds bytes.len() bytes and cannot
        // overlap a borrowed slice.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), user.as_ptr(), bytes.len());
        }
        Ok(user)
    }

    /// Tracked NUL-terminated copy of `s`; the record covers the terminator.
    pub fn dup_str(&self, s: &str) -> Result<UserPtr, AllocError> {
        let len = s.len();
        let user = self.alloc(len.saturating_add(1))?;
        // SAFETY: the fresh user region holds len + 1 bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(s.as_ptr(), user.as_ptr(), len);
            user.as_ptr().add(len).write(0);
        }
        Ok(user)
    }

    /// Retire and release `user`. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `user` must not be accessed after this call, and if it is live in the
    /// tracker it must have come from this allocator's raw source.
    pub unsafe fn free(&self, user: Option<UserPtr>) -> Result<(), AllocError> {
        let Some(user) = user else {
            return Ok(());
        };
        // SAFETY: forwarded caller contract.
        let raw = unsafe { self.tracker.notify_free_block(self.id, user) }
            .map_err(|err| self.violation(err))?;
        // SAFETY: the tracker handed back the block this allocator produced.
        unsafe { self.raw.release(raw) };
        Ok(())
    }

    fn violation(&self, err: TrackerError) -> AllocError {
        match self.on_violation {
            ViolationPolicy::Abort => err.abort(),
            ViolationPolicy::Report => AllocError::Tracker(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::canary::GuardRegion;
    use crate::structured_log::NullSink;

    fn tracker(canaries: bool) -> AllocationTracker {
        let t = AllocationTracker::with_sink(Arc::new(NullSink));
        t.init(canaries);
        t
    }

    #[test]
    fn alloc_and_free_balance_the_ledger() {
        let t = tracker(true);
        let a = TrackedAllocator::new(&t).on_violation(ViolationPolicy::Report);
        let p = a.alloc_zeroed(40).unwrap();
        assert_eq!(t.outstanding_bytes(), 40);
        // SAFETY: 40 bytes were zeroed above.
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 40) };
        assert!(bytes.iter().all(|b| *b == 0));
        // SAFETY: p is live and not used afterwards.
        unsafe { a.free(Some(p)) }.unwrap();
        assert_eq!(t.expect_no_allocations(), 0);
    }

    #[test]
    fn dup_str_is_nul_terminated() {
        let t = tracker(true);
        let a = TrackedAllocator::new(&t).on_violation(ViolationPolicy::Report);
        let p = a.dup_str("btu").unwrap();
        // SAFETY: dup_str wrote four bytes.
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 4) };
        assert_eq!(bytes, b"btu\0");
        assert_eq!(t.record_for(p).unwrap().requested_size, 4);
        // SAFETY: p is live.
        unsafe { a.free(Some(p)) }.unwrap();
    }

    #[test]
    fn oversized_request_is_rejected_before_allocating() {
        let t = tracker(true);
        let a = TrackedAllocator::new(&t).on_violation(ViolationPolicy::Report);
        assert!(matches!(
            a.alloc(usize::MAX),
            Err(AllocError::SizeOverflow { .. })
        ));
        assert_eq!(t.live_allocations(), 0);
    }

    #[test]
    fn free_null_is_noop() {
        let t = tracker(false);
        let a = TrackedAllocator::new(&t).on_violation(ViolationPolicy::Report);
        // SAFETY: nothing is freed.
        unsafe { a.free(None) }.unwrap();
        assert_eq!(t.metrics().null_passthroughs, 0);
    }

    #[test]
    fn head_underrun_is_reported_and_block_kept() {
        let t = tracker(true);
        let a = TrackedAllocator::new(&t).on_violation(ViolationPolicy::Report);
        let p = a.alloc(8).unwrap();
        // SAFETY: one byte before the user region is inside the head guard.
        unsafe { p.as_ptr().sub(1).write(0) };
        // SAFETY: p is live; the corrupted block is leaked on purpose.
        let err = unsafe { a.free(Some(p)) }.unwrap_err();
        assert!(matches!(
            err,
            AllocError::Tracker(TrackerError::CanaryMismatch {
                region: GuardRegion::Head,
                ..
            })
        ));
        assert_eq!(t.live_allocations(), 0);
    }

    #[test]
    fn freeing_through_another_allocator_is_a_mismatch() {
        let t = tracker(false);
        let first = TrackedAllocator::with_raw(&t, LibcRaw, AllocatorId(1))
            .on_violation(ViolationPolicy::Report);
        let second = TrackedAllocator::with_raw(&t, LibcRaw, AllocatorId(2))
            .on_violation(ViolationPolicy::Report);
        let p = first.alloc(16).unwrap();
        // SAFETY: the mismatch is detected before any release.
        let err = unsafe { second.free(Some(p)) }.unwrap_err();
        assert!(matches!(
            err,
            AllocError::Tracker(TrackerError::AllocatorMismatch { .. })
        ));
        assert_eq!(t.live_allocations(), 1);
        // SAFETY: p is still live under its own allocator.
        unsafe { first.free(Some(p)) }.unwrap();
        assert_eq!(t.metrics().allocator_mismatches, 1);
    }
}
