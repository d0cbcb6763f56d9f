//! Typed views over one tracked block.
//!
//! A [`RawBlock`] is the address the raw allocator handed out; a [`UserPtr`]
//! is the address the caller works with. When guards are installed the two
//! differ by the head guard length, and only [`crate::canary`] converts
//! between them. Unguarded blocks use [`UserPtr::unguarded`] and
//! [`RawBlock::unguarded`], which keep the address as is.

#![allow(unsafe_code)]

use std::fmt;
use std::ptr::NonNull;

/// Start of a block as returned by the raw allocator (including any guards).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawBlock(NonNull<u8>);

/// Start of the user data region of a tracked block.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserPtr(NonNull<u8>);

// SAFETY: both types are address handles. Dereferencing them always goes
// through an `unsafe` call whose contract covers the memory itself.
unsafe impl Send for RawBlock {}
// SAFETY: see above.
unsafe impl Sync for RawBlock {}
// SAFETY: see above.
unsafe impl Send for UserPtr {}
// SAFETY: see above.
unsafe impl Sync for UserPtr {}

impl RawBlock {
    /// Wrap a raw allocator result. Null yields `None`.
    #[must_use]
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// The raw block of an allocation that carries no head guard.
    #[must_use]
    pub const fn unguarded(user: UserPtr) -> Self {
        Self(user.0)
    }

    pub(crate) const fn from_non_null(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    #[must_use]
    pub const fn as_non_null(self) -> NonNull<u8> {
        self.0
    }

    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl UserPtr {
    /// Wrap a user pointer. Null yields `None`.
    #[must_use]
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// The user region of an allocation that carries no head guard.
    #[must_use]
    pub const fn unguarded(raw: RawBlock) -> Self {
        Self(raw.0)
    }

    pub(crate) const fn from_non_null(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    #[must_use]
    pub const fn as_non_null(self) -> NonNull<u8> {
        self.0
    }

    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl fmt::Debug for RawBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawBlock({:#x})", self.addr())
    }
}

impl fmt::Debug for UserPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserPtr({:#x})", self.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_none() {
        assert!(RawBlock::new(std::ptr::null_mut()).is_none());
        assert!(UserPtr::new(std::ptr::null_mut()).is_none());
    }

    #[test]
    fn unguarded_views_share_the_address() {
        let mut buf = [0_u8; 8];
        let raw = RawBlock::new(buf.as_mut_ptr()).unwrap();
        let user = UserPtr::unguarded(raw);
        assert_eq!(user.addr(), raw.addr());
        assert_eq!(RawBlock::unguarded(user), raw);
    }

    #[test]
    fn debug_prints_hex_address() {
        let mut buf = [0_u8; 1];
        let raw = RawBlock::new(buf.as_mut_ptr()).unwrap();
        assert_eq!(format!("{raw:?}"), format!("RawBlock({:#x})", raw.addr()));
    }
}
