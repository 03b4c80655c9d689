//! The collector surface the runtime consumes.

use crate::attr::{BlkAttr, BlkInfo};
use std::ptr::NonNull;

/// Allocation and query interface of the garbage collector.
///
/// The trait is object-safe; the runtime holds a `&dyn GcHeap` and never
/// depends on a concrete collector. Implementations must be callable from
/// any thread.
///
/// Every allocating, extending, or freeing method is a potential
/// suspension point: the call may trigger a collection and block the
/// calling thread until it completes.
pub trait GcHeap: Sync {
    /// Allocate `size` bytes with the given attributes.
    ///
    /// The returned memory is uninitialized unless the implementation
    /// documents otherwise. Returns `None` on exhaustion.
    fn malloc(&self, size: usize, attr: BlkAttr) -> Option<NonNull<u8>>;

    /// Allocate `size` zeroed bytes with the given attributes.
    fn calloc(&self, size: usize, attr: BlkAttr) -> Option<NonNull<u8>>;

    /// Allocate and return the full block descriptor in one call.
    ///
    /// The descriptor's `size` reflects size-class rounding and may
    /// exceed `size`.
    fn qalloc(&self, size: usize, attr: BlkAttr) -> Option<BlkInfo>;

    /// Try to grow the block at `base` in place by at least `min_extra`
    /// bytes, up to `max_extra`.
    ///
    /// Returns the block's new total size, or 0 if the block could not be
    /// extended without moving.
    fn extend(&self, base: *mut u8, min_extra: usize, max_extra: usize) -> usize;

    /// Release the block at `base` back to the collector.
    fn free(&self, base: *mut u8);

    /// Resolve an interior pointer to its block descriptor.
    ///
    /// Returns a null descriptor when `p` does not point into a managed
    /// block.
    fn query(&self, p: *const u8) -> BlkInfo;

    /// Total size of the block containing `p`, or 0.
    fn size_of(&self, p: *const u8) -> usize {
        self.query(p).size
    }

    /// Base address of the block containing `p`, or null.
    fn addr_of(&self, p: *const u8) -> *mut u8 {
        self.query(p).base
    }

    /// Attribute bits of the block containing `p`.
    fn get_attr(&self, p: *const u8) -> BlkAttr;

    /// Set the given attribute bits; returns the resulting bits.
    fn set_attr(&self, p: *const u8, attr: BlkAttr) -> BlkAttr;

    /// Clear the given attribute bits; returns the resulting bits.
    fn clr_attr(&self, p: *const u8, attr: BlkAttr) -> BlkAttr;

    /// Whether the block at `base` is about to be reclaimed by the sweep
    /// in progress. Only meaningful between mark and sweep, under the
    /// collector's stop-the-world discipline.
    fn is_collecting(&self, base: *mut u8) -> bool;
}
