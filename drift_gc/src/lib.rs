//! Drift collector contract.
//!
//! The array runtime core never talks to a concrete collector. Everything
//! it needs is expressed here:
//!
//! - **Block descriptors**: a `(base, size, attrs)` triple describing a
//!   live block, where `size` may exceed the requested size due to
//!   size-class rounding.
//! - **Attribute bits**: per-block flags the collector honors during
//!   marking, sweeping, and finalization.
//! - **The `GcHeap` trait**: the allocation/query/extend surface a
//!   collector must provide.
//! - **Host hooks**: process-wide sinks for out-of-memory and finalizer
//!   failures.
//!
//! The crate also ships [`SimHeap`], a deterministic in-process heap that
//! implements [`GcHeap`] for the runtime's test suite. It rounds requests
//! to real size classes and supports in-place extension, but performs no
//! marking of its own.
//!
//! # Safety
//!
//! Any allocating or freeing call on a [`GcHeap`] is a suspension point:
//! it may stop the calling thread for a collection. Callers must not hold
//! runtime-internal locks across these calls.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod attr;
mod heap;

pub mod hooks;
pub mod sim;

pub use attr::{BlkAttr, BlkInfo};
pub use heap::GcHeap;
pub use sim::SimHeap;
