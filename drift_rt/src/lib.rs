//! Drift managed-array runtime core.
//!
//! Implements the semantics of growable, sliceable, garbage-collected
//! arrays with amortized O(1) append, plus class-instance lifecycle, on
//! top of a conservative mark-sweep collector reached through
//! [`drift_gc::GcHeap`].
//!
//! # Architecture
//!
//! The hard part is letting many slices share one block while keeping
//! value semantics. Three pieces cooperate:
//!
//! - **In-band metadata** ([`layout`], [`meta`]): every appendable block
//!   stores a used-length field inside the block itself, at a position
//!   that depends on the block's size class. Any slice can find it from
//!   the block descriptor alone.
//! - **Stealing-safe append** ([`array`]): a slice may grow in place only
//!   if its end coincides with the block's used length, and it claims the
//!   new tail with a compare-and-set on that field. Losing the race means
//!   falling back to reallocation; at most one slice ever wins a shared
//!   tail.
//! - **Block-info cache** ([`cache`]): an 8-way per-thread cache maps
//!   interior pointers to block descriptors so the collector is not
//!   queried on every operation. The collector's sweep knocks out entries
//!   for blocks it reclaims.
//!
//! [`class`] is independent of the array machinery and handles instance
//! allocation and finalizer chains.
//!
//! # Usage
//!
//! ```ignore
//! use drift_gc::SimHeap;
//! use drift_rt::{Runtime, TypeDesc};
//!
//! let heap = SimHeap::new();
//! let rt = Runtime::new(&heap);
//!
//! let int = TypeDesc::new(4);
//! let mut arr = rt.new_array(&int, 8);
//! rt.append_elems(&int, &mut arr, 4);
//! ```

#![warn(clippy::all)]

pub mod array;
pub mod cache;
pub mod class;
pub mod layout;
pub mod meta;
pub mod policy;
pub mod slice;
pub mod stats;
pub mod typeinfo;

pub use cache::process_gc_marks;
pub use class::{ClassFlags, ClassInfo, ClassShape, Destructor, ObjectHeader, VTable};
pub use class::{collect_handler, set_collect_handler, set_monitor_delete};
pub use class::{CollectHandler, MonitorDelete};
pub use slice::RawSlice;
pub use stats::RtStats;
pub use typeinfo::{TypeDesc, TypeFlags};

use drift_gc::GcHeap;

/// Handle to the array runtime, bound to a collector.
///
/// The handle itself is stateless apart from statistics; all array state
/// lives in collector blocks and the per-thread cache, so a `Runtime` can
/// be shared freely across threads.
pub struct Runtime<'gc> {
    pub(crate) gc: &'gc dyn GcHeap,
    pub(crate) stats: RtStats,
}

impl<'gc> Runtime<'gc> {
    /// Create a runtime on top of the given collector.
    pub fn new(gc: &'gc dyn GcHeap) -> Self {
        Self {
            gc,
            stats: RtStats::new(),
        }
    }

    /// The collector this runtime allocates from.
    #[inline]
    pub fn gc(&self) -> &dyn GcHeap {
        self.gc
    }

    /// Activity counters.
    #[inline]
    pub fn stats(&self) -> &RtStats {
        &self.stats
    }
}
