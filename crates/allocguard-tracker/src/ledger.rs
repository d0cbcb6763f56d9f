//! Live-allocation map keyed by user address.
//!
//! One `parking_lot::Mutex` guards the map, the outstanding byte counter and
//! the high-water marks, so every counter moves in the same critical section
//! as the map entry it accounts for. Nothing here touches block memory or
//! does I/O while the lock is held.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::TrackerError;

/// Tag naming which allocator produced a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AllocatorId(pub u8);

impl AllocatorId {
    pub const DEFAULT: Self = Self(0);
}

impl Default for AllocatorId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for AllocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocator#{}", self.0)
    }
}

/// Metadata for one live tracked allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    /// Address handed to the caller.
    pub user_addr: usize,
    /// Size asked for by the caller, guards excluded.
    pub requested_size: usize,
    /// Whether guards were installed for this entry.
    pub canary_active: bool,
    /// Allocator that produced the block.
    pub allocator: AllocatorId,
    /// Allocation order within the tracker; stamped by [`Ledger::insert`].
    pub seq: u64,
}

impl AllocationRecord {
    #[must_use]
    pub const fn new(
        user_addr: usize,
        requested_size: usize,
        canary_active: bool,
        allocator: AllocatorId,
    ) -> Self {
        Self {
            user_addr,
            requested_size,
            canary_active,
            allocator,
            seq: 0,
        }
    }
}

/// Counters read in one critical section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerTotals {
    pub live_count: usize,
    pub outstanding_bytes: usize,
    pub peak_count: usize,
    pub peak_bytes: usize,
}

#[derive(Debug, Default)]
struct LedgerState {
    records: HashMap<usize, AllocationRecord>,
    outstanding_bytes: usize,
    peak_bytes: usize,
    peak_count: usize,
    next_seq: u64,
}

impl LedgerState {
    fn retire(&mut self, record: &AllocationRecord) {
        self.outstanding_bytes = self.outstanding_bytes.saturating_sub(record.requested_size);
    }
}

/// Thread-safe map from user address to [`AllocationRecord`].
#[derive(Debug, Default)]
pub struct Ledger {
    state: Mutex<LedgerState>,
}

impl Ledger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new live allocation and return it with its sequence number.
    ///
    /// A key that is already live is a [`TrackerError::LedgerCollision`]; the
    /// existing record is left untouched.
    pub fn insert(&self, record: AllocationRecord) -> Result<AllocationRecord, TrackerError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.records.get(&record.user_addr) {
            return Err(TrackerError::LedgerCollision {
                addr: record.user_addr,
                existing_size: existing.requested_size,
                requested_size: record.requested_size,
            });
        }

        let stamped = AllocationRecord {
            seq: state.next_seq,
            ..record
        };
        state.next_seq += 1;
        state.records.insert(stamped.user_addr, stamped);
        state.outstanding_bytes = state.outstanding_bytes.saturating_add(stamped.requested_size);
        state.peak_bytes = state.peak_bytes.max(state.outstanding_bytes);
        state.peak_count = state.peak_count.max(state.records.len());
        Ok(stamped)
    }

    /// Erase and return the record for `user_addr`, if any.
    pub fn remove(&self, user_addr: usize) -> Option<AllocationRecord> {
        let mut state = self.state.lock();
        let record = state.records.remove(&user_addr)?;
        state.retire(&record);
        Some(record)
    }

    /// Erase the record for `user_addr` if `allocator` produced it.
    ///
    /// On an allocator mismatch the record stays live.
    pub fn take(
        &self,
        user_addr: usize,
        allocator: AllocatorId,
    ) -> Result<AllocationRecord, TrackerError> {
        let mut state = self.state.lock();
        let Some(existing) = state.records.get(&user_addr).copied() else {
            return Err(TrackerError::UnknownPointer { addr: user_addr });
        };
        if existing.allocator != allocator {
            return Err(TrackerError::AllocatorMismatch {
                addr: user_addr,
                expected: existing.allocator,
                actual: allocator,
            });
        }
        state.records.remove(&user_addr);
        state.retire(&existing);
        Ok(existing)
    }

    /// Live record for `user_addr`, without changing anything.
    #[must_use]
    pub fn get(&self, user_addr: usize) -> Option<AllocationRecord> {
        self.state.lock().records.get(&user_addr).copied()
    }

    /// Every live record in allocation order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        let mut records: Vec<AllocationRecord> =
            self.state.lock().records.values().copied().collect();
        records.sort_unstable_by_key(|record| record.seq);
        records
    }

    #[must_use]
    pub fn totals(&self) -> LedgerTotals {
        let state = self.state.lock();
        LedgerTotals {
            live_count: state.records.len(),
            outstanding_bytes: state.outstanding_bytes,
            peak_count: state.peak_count,
            peak_bytes: state.peak_bytes,
        }
    }

    #[must_use]
    pub fn outstanding_bytes(&self) -> usize {
        self.state.lock().outstanding_bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record and zero all counters.
    pub fn clear(&self) {
        *self.state.lock() = LedgerState::default();
    }
}
