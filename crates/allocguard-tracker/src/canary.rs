//! Fixed-pattern guard regions around a tracked user region.
//!
//! A canary-protected block, seen from the raw allocator:
//!
//! ```plaintext
//! +------------------+ <- RawBlock
//! | head guard       | HEAD_GUARD_LEN bytes of HEAD_PATTERN
//! +------------------+ <- UserPtr
//! | user data        | requested_size bytes
//! +------------------+
//! | tail guard       | TAIL_GUARD_LEN bytes of TAIL_PATTERN
//! +------------------+
//! ```
//!
//! The head guard is 16 bytes so a 16-byte aligned raw block keeps its user
//! region 16-byte aligned. Both patterns are fixed per build and differ from
//! each other, so a block freed at the wrong offset fails verification.

#![allow(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ptr::{RawBlock, UserPtr};

/// Bytes reserved in front of the user region.
pub const HEAD_GUARD_LEN: usize = 16;

/// Bytes reserved after the user region.
pub const TAIL_GUARD_LEN: usize = 8;

/// Total extra bytes a canary-protected allocation needs.
pub const GUARD_OVERHEAD: usize = HEAD_GUARD_LEN + TAIL_GUARD_LEN;

const PATTERN_SEED: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Expected head guard contents.
pub const HEAD_PATTERN: [u8; HEAD_GUARD_LEN] = head_pattern();

/// Expected tail guard contents.
pub const TAIL_PATTERN: [u8; TAIL_GUARD_LEN] = tail_pattern();

const fn head_pattern() -> [u8; HEAD_GUARD_LEN] {
    let seed = PATTERN_SEED.to_le_bytes();
    let mut out = [0_u8; HEAD_GUARD_LEN];
    let mut i = 0;
    while i < HEAD_GUARD_LEN {
        out[i] = seed[i % seed.len()];
        i += 1;
    }
    out
}

const fn tail_pattern() -> [u8; TAIL_GUARD_LEN] {
    // XOR-fold with the 32-bit rotation so no byte matches the head pattern.
    (PATTERN_SEED ^ PATTERN_SEED.rotate_left(32)).to_le_bytes()
}

/// Which guard region a check refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardRegion {
    Head,
    Tail,
}

impl fmt::Display for GuardRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Head => "head",
            Self::Tail => "tail",
        })
    }
}

/// Outcome of re-reading both guards of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardVerdict {
    pub head_intact: bool,
    pub tail_intact: bool,
}

impl GuardVerdict {
    #[must_use]
    pub const fn is_intact(self) -> bool {
        self.head_intact && self.tail_intact
    }

    /// First damaged region, head before tail.
    #[must_use]
    pub const fn failed_region(self) -> Option<GuardRegion> {
        if !self.head_intact {
            Some(GuardRegion::Head)
        } else if !self.tail_intact {
            Some(GuardRegion::Tail)
        } else {
            None
        }
    }
}

/// Extra bytes a caller must request on top of `requested_size`.
///
/// Constant for any size: zero with canaries off, [`GUARD_OVERHEAD`] with
/// canaries on.
#[must_use]
pub const fn overhead_for(requested_size: usize, canaries_enabled: bool) -> usize {
    let _ = requested_size;
    if canaries_enabled { GUARD_OVERHEAD } else { 0 }
}

/// The user region of a canary-protected block.
///
/// # Safety
///
/// `raw` must point to a block of at least `HEAD_GUARD_LEN` bytes.
#[must_use]
pub unsafe fn user_region(raw: RawBlock) -> UserPtr {
    // SAFETY: the caller guarantees the head guard lies inside the block.
    UserPtr::from_non_null(unsafe { raw.as_non_null().add(HEAD_GUARD_LEN) })
}

/// The raw block behind a canary-protected user region.
///
/// # Safety
///
/// `user` must have been produced by [`user_region`].
#[must_use]
pub unsafe fn raw_block(user: UserPtr) -> RawBlock {
    // SAFETY: `user` sits HEAD_GUARD_LEN bytes into the same block.
    RawBlock::from_non_null(unsafe { user.as_non_null().sub(HEAD_GUARD_LEN) })
}

/// Write both guard patterns around the user region of `raw`.
///
/// # Safety
///
/// `raw` must be valid for writes of `requested_size + GUARD_OVERHEAD` bytes,
/// and no other thread may access those bytes during the call.
pub unsafe fn install(raw: RawBlock, requested_size: usize) {
    let base = raw.as_ptr();
    // SAFETY: both ranges lie inside the block per the caller contract.
    unsafe {
        std::ptr::copy_nonoverlapping(HEAD_PATTERN.as_ptr(), base, HEAD_GUARD_LEN);
        std::ptr::copy_nonoverlapping(
            TAIL_PATTERN.as_ptr(),
            base.add(HEAD_GUARD_LEN + requested_size),
            TAIL_GUARD_LEN,
        );
    }
}

/// Re-read both guards of `raw` and compare them to the expected patterns.
///
/// # Safety
///
/// Same as [`install`], for reads.
#[must_use]
pub unsafe fn verify(raw: RawBlock, requested_size: usize) -> GuardVerdict {
    let base = raw.as_ptr().cast_const();
    let mut head = [0_u8; HEAD_GUARD_LEN];
    let mut tail = [0_u8; TAIL_GUARD_LEN];
    // SAFETY: both ranges lie inside the block per the caller contract.
    unsafe {
        std::ptr::copy_nonoverlapping(base, head.as_mut_ptr(), HEAD_GUARD_LEN);
        std::ptr::copy_nonoverlapping(
            base.add(HEAD_GUARD_LEN + requested_size),
            tail.as_mut_ptr(),
            TAIL_GUARD_LEN,
        );
    }
    GuardVerdict {
        head_intact: head == HEAD_PATTERN,
        tail_intact: tail == TAIL_PATTERN,
    }
}
