//! Failure taxonomy for the tracker and its reference caller.

use thiserror::Error;

use crate::canary::GuardRegion;
use crate::ledger::AllocatorId;
use crate::structured_log::{LogSink, StderrSink};

/// Protocol violations and heap corruption detected by the tracker.
///
/// Every variant means memory safety is already compromised. The tracker
/// never aborts on its own; the top-level caller decides, usually by calling
/// [`TrackerError::abort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// Free of a pointer with no live record: double free or foreign pointer.
    #[error("free of untracked pointer {addr:#x} (double free or foreign pointer)")]
    UnknownPointer { addr: usize },
    /// The raw allocator handed out an address that is still live.
    #[error("pointer {addr:#x} reissued for {requested_size} bytes, live with {existing_size}")]
    LedgerCollision {
        addr: usize,
        existing_size: usize,
        requested_size: usize,
    },
    /// A guard region no longer holds its pattern.
    #[error("{region} guard corrupted for allocation {addr:#x} of {requested_size} bytes")]
    CanaryMismatch {
        addr: usize,
        requested_size: usize,
        region: GuardRegion,
    },
    /// Freed through a different allocator than the one that allocated it.
    #[error("pointer {addr:#x} allocated by {expected} but freed by {actual}")]
    AllocatorMismatch {
        addr: usize,
        expected: AllocatorId,
        actual: AllocatorId,
    },
}

impl TrackerError {
    /// Structured log event name.
    #[must_use]
    pub const fn event(&self) -> &'static str {
        match self {
            Self::UnknownPointer { .. } => "unknown_pointer_free",
            Self::LedgerCollision { .. } => "ledger_collision",
            Self::CanaryMismatch { .. } => "canary_mismatch",
            Self::AllocatorMismatch { .. } => "allocator_mismatch",
        }
    }

    /// User address the violation concerns.
    #[must_use]
    pub const fn addr(&self) -> usize {
        match *self {
            Self::UnknownPointer { addr }
            | Self::LedgerCollision { addr, .. }
            | Self::CanaryMismatch { addr, .. }
            | Self::AllocatorMismatch { addr, .. } => addr,
        }
    }

    /// Log to stderr and abort the process.
    pub fn abort(self) -> ! {
        StderrSink.emit(self.to_log_entry());
        std::process::abort()
    }
}

/// Errors surfaced by [`crate::raw_alloc::TrackedAllocator`].
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("raw allocator could not provide {size} bytes")]
    OutOfMemory { size: usize },
    #[error("request for {requested} bytes overflows once guard overhead is added")]
    SizeOverflow { requested: usize },
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_hex_address() {
        let err = TrackerError::UnknownPointer { addr: 0x1000 };
        assert_eq!(
            err.to_string(),
            "free of untracked pointer 0x1000 (double free or foreign pointer)"
        );
        let err = TrackerError::CanaryMismatch {
            addr: 0x20,
            requested_size: 64,
            region: GuardRegion::Tail,
        };
        assert_eq!(
            err.to_string(),
            "tail guard corrupted for allocation 0x20 of 64 bytes"
        );
    }

    #[test]
    fn event_and_addr_per_variant() {
        let err = TrackerError::AllocatorMismatch {
            addr: 0x40,
            expected: AllocatorId(1),
            actual: AllocatorId(2),
        };
        assert_eq!(err.event(), "allocator_mismatch");
        assert_eq!(err.addr(), 0x40);
        assert_eq!(
            err.to_string(),
            "pointer 0x40 allocated by allocator#1 but freed by allocator#2"
        );
    }

    #[test]
    fn tracker_error_converts_into_alloc_error() {
        let err: AllocError = TrackerError::UnknownPointer { addr: 8 }.into();
        assert!(matches!(
            err,
            AllocError::Tracker(TrackerError::UnknownPointer { addr: 8 })
        ));
    }
}
