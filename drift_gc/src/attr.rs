//! Block descriptors and attribute bits.

use bitflags::bitflags;
use std::ptr;

bitflags! {
    /// Per-block attribute bits understood by the collector.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlkAttr: u32 {
        /// Block holds an object whose finalizer must run before the
        /// memory is reclaimed.
        const FINALIZE = 1 << 0;
        /// Collector need not scan this block for pointers.
        const NO_SCAN = 1 << 1;
        /// Block is pinned; the collector may never move it.
        const NO_MOVE = 1 << 2;
        /// Block carries in-band array length metadata.
        const APPENDABLE = 1 << 3;
        /// Mask covering every attribute bit.
        const ALL_BITS = 0xff;
    }
}

/// Descriptor for a live block returned by the collector.
///
/// `size` is the block's total byte capacity, which may exceed the
/// requested size due to size-class rounding. A null descriptor
/// (`base.is_null()`) means the queried pointer is not in the managed
/// heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkInfo {
    /// Address the collector returned for this block.
    pub base: *mut u8,
    /// Total byte capacity of the block.
    pub size: usize,
    /// Attribute bits.
    pub attr: BlkAttr,
}

impl BlkInfo {
    /// The "not a block" descriptor.
    pub const fn null() -> Self {
        Self {
            base: ptr::null_mut(),
            size: 0,
            attr: BlkAttr::empty(),
        }
    }

    /// Whether this descriptor describes no block.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.base.is_null()
    }

    /// Whether `p` points into this block.
    #[inline]
    pub fn contains(&self, p: *const u8) -> bool {
        let addr = p as usize;
        let base = self.base as usize;
        addr >= base && addr < base + self.size
    }
}

impl Default for BlkInfo {
    fn default() -> Self {
        Self::null()
    }
}

// Safety: a descriptor is three plain words; dereferencing `base` is
// governed by the caller's contract with the collector, not by which
// thread holds the descriptor.
unsafe impl Send for BlkInfo {}
unsafe impl Sync for BlkInfo {}
