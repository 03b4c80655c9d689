//! Array operations.
//!
//! Every growth path follows one skeleton:
//!
//! 1. resolve the backing block, thread cache first, collector query
//!    second (shared types skip the cache);
//! 2. compute the slice's offset and the block's used length;
//! 3. if the slice owns the tail, claim the new tail with a
//!    compare-and-set on the used length; page-sized blocks that are
//!    merely too small get a chance to extend in place first;
//! 4. otherwise reallocate, copy, and install fresh metadata.
//!
//! Step 3 is what preserves value semantics across aliasing slices: a
//! slice that does not end at the used length can never grow in place, so
//! appends through one slice are invisible through every other.

use crate::cache;
use crate::layout::{self, LARGE_PAD, PAGE_SIZE};
use crate::meta;
use crate::policy;
use crate::slice::RawSlice;
use crate::stats::RtStats;
use crate::typeinfo::TypeDesc;
use crate::Runtime;
use drift_gc::{hooks, BlkAttr, BlkInfo, GcHeap};
use smallvec::SmallVec;
use std::ptr;

/// Byte count of `len` elements, or OOM on overflow.
///
/// Also guarantees headroom for the largest metadata pad, so later
/// `bytes + pad` arithmetic cannot wrap.
fn checked_bytes(ti: &TypeDesc, len: usize) -> usize {
    len.checked_mul(ti.elem_size())
        .and_then(|bytes| bytes.checked_add(LARGE_PAD).map(|_| bytes))
        .unwrap_or_else(|| hooks::out_of_memory())
}

impl<'gc> Runtime<'gc> {
    // =========================================================================
    // Block resolution
    // =========================================================================

    /// Resolve the block backing `ptr`, preferring the thread cache.
    ///
    /// Returns the descriptor plus the cache slot that holds it, if any.
    /// Shared types bypass the cache entirely: the cache is thread-local
    /// and a shared slice's block may be resized from another thread.
    fn resolve_block(&self, ptr: *const u8, shared: bool) -> (BlkInfo, Option<usize>) {
        if !shared {
            if let Some((info, slot)) = cache::find(ptr) {
                RtStats::bump(&self.stats.cache_hits);
                return (info, Some(slot));
            }
            RtStats::bump(&self.stats.cache_misses);
        }
        let info = self.gc.query(ptr);
        let slot = if !shared && !info.is_null() {
            cache::insert(info, None)
        } else {
            None
        };
        (info, slot)
    }

    /// Allocate a fresh appendable block holding `used_bytes` of payload
    /// with room for `cap_bytes`, and install its metadata.
    fn alloc_array_block(&self, ti: &TypeDesc, used_bytes: usize, cap_bytes: usize) -> (BlkInfo, *mut u8) {
        debug_assert!(cap_bytes >= used_bytes);
        let request = cap_bytes
            .checked_add(layout::array_pad(cap_bytes))
            .unwrap_or_else(|| hooks::out_of_memory());
        let info = self
            .gc
            .qalloc(request, ti.block_attrs())
            .unwrap_or_else(|| hooks::out_of_memory());
        let start = layout::array_start(&info);
        // Safety: freshly allocated block, no competing slice yet.
        unsafe { meta::init_used(&info, used_bytes) };
        if !ti.is_shared() {
            cache::insert(info, None);
        }
        RtStats::bump(&self.stats.arrays_allocated);
        (info, start)
    }

    // =========================================================================
    // The grow skeleton
    // =========================================================================

    /// Grow `slice` to `new_len` elements, in place when it owns its
    /// block's tail, by reallocation otherwise. The new tail bytes are
    /// uninitialized; returns a pointer to the first of them.
    ///
    /// `overshoot` selects policy-driven over-allocation on reallocation
    /// and extension (appends overshoot, exact resizes do not).
    fn grow_raw(&self, ti: &TypeDesc, slice: &mut RawSlice, new_len: usize, overshoot: bool) -> *mut u8 {
        debug_assert!(new_len >= slice.len);
        let elem = ti.elem_size();
        let old_bytes = checked_bytes(ti, slice.len);
        let new_bytes = checked_bytes(ti, new_len);

        if !slice.data.is_null() {
            let shared = ti.is_shared();
            let (info, slot) = self.resolve_block(slice.data, shared);
            if !info.is_null() && info.attr.contains(BlkAttr::APPENDABLE) {
                if let Some(tail) =
                    self.try_grow_in_place(ti, slice, &info, slot, old_bytes, new_bytes, new_len, overshoot)
                {
                    RtStats::bump(&self.stats.grows_in_place);
                    slice.len = new_len;
                    return tail;
                }
            }
        }

        // Step 4: fresh block, carry the slice's contents over.
        let cap_bytes = if overshoot {
            policy::new_capacity(new_len, elem).max(new_bytes)
        } else {
            new_bytes
        };
        let (_, start) = self.alloc_array_block(ti, new_bytes, cap_bytes);
        if old_bytes != 0 {
            // Safety: the old block stays live (the collector owns it)
            // and the new block is disjoint.
            unsafe { ptr::copy_nonoverlapping(slice.data, start, old_bytes) };
            RtStats::add(&self.stats.bytes_copied, old_bytes as u64);
        }
        RtStats::bump(&self.stats.grows_relocated);
        slice.data = start;
        slice.len = new_len;
        // Safety: start + old_bytes is within the fresh allocation.
        unsafe { start.add(old_bytes) }
    }

    /// Steps 2 and 3 of the skeleton. Returns the new tail pointer on
    /// success, `None` when the caller must reallocate.
    #[allow(clippy::too_many_arguments)]
    fn try_grow_in_place(
        &self,
        ti: &TypeDesc,
        slice: &RawSlice,
        info: &BlkInfo,
        slot: Option<usize>,
        old_bytes: usize,
        new_bytes: usize,
        new_len: usize,
        overshoot: bool,
    ) -> Option<*mut u8> {
        let start = layout::array_start(info);
        if (slice.data as usize) < (start as usize) {
            return None;
        }
        let offset = slice.data as usize - start as usize;
        // Safety: live appendable block per the caller's resolution.
        let used = unsafe { meta::used_len(info) };
        if offset + old_bytes != used {
            // Someone else owns the tail.
            return None;
        }
        let target = offset + new_bytes;
        let shared = ti.is_shared();

        if target + layout::pad_for_block(info.size) <= info.size {
            // Room in the current block; claim the tail.
            if unsafe { meta::try_set_used(info, target, shared, Some(used)) } {
                return Some(unsafe { slice.data.add(old_bytes) });
            }
            // Lost the race to another slice.
            return None;
        }

        if layout::is_large(info.size) {
            // The block itself is too small; page-backed blocks can often
            // grow without moving.
            let needed = target + LARGE_PAD - info.size;
            let wanted = if overshoot {
                policy::new_capacity(new_len, ti.elem_size())
                    .saturating_add(offset + LARGE_PAD)
                    .saturating_sub(info.size)
                    .max(needed)
            } else {
                needed
            };
            let newsize = self.gc.extend(info.base, needed, wanted);
            if newsize != 0 {
                RtStats::bump(&self.stats.blocks_extended);
                let refreshed = BlkInfo {
                    size: newsize,
                    ..*info
                };
                if !shared {
                    cache::insert(refreshed, slot);
                }
                if unsafe { meta::try_set_used(&refreshed, target, shared, Some(used)) } {
                    return Some(unsafe { slice.data.add(old_bytes) });
                }
            }
        }
        None
    }

    /// Fill `n` elements at `dst` from the type's initializer template.
    ///
    /// An empty template zero-fills; one- and four-byte templates take
    /// specialized paths.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `n * elem_size` bytes.
    unsafe fn init_fill(ti: &TypeDesc, dst: *mut u8, n: usize) {
        let template = ti.init_template();
        if template.is_empty() {
            ptr::write_bytes(dst, 0, n * ti.elem_size());
            return;
        }
        match template.len() {
            1 => ptr::write_bytes(dst, template[0], n),
            4 => {
                let word = u32::from_ne_bytes([template[0], template[1], template[2], template[3]]);
                let words = dst as *mut u32;
                for i in 0..n {
                    words.add(i).write_unaligned(word);
                }
            }
            len => {
                for i in 0..n {
                    ptr::copy_nonoverlapping(template.as_ptr(), dst.add(i * len), len);
                }
            }
        }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Allocate a zero-initialized array of `n` elements.
    ///
    /// Zero elements, or a zero-sized element type, yields a null slice
    /// without allocating.
    pub fn new_array(&self, ti: &TypeDesc, n: usize) -> RawSlice {
        self.new_array_impl(ti, n, false)
    }

    /// Allocate an array of `n` elements stamped from the type's
    /// initializer template.
    pub fn new_array_init(&self, ti: &TypeDesc, n: usize) -> RawSlice {
        self.new_array_impl(ti, n, true)
    }

    fn new_array_impl(&self, ti: &TypeDesc, n: usize, pattern: bool) -> RawSlice {
        if n == 0 || ti.elem_size() == 0 {
            return RawSlice::null();
        }
        let bytes = checked_bytes(ti, n);
        let (_, start) = self.alloc_array_block(ti, bytes, bytes);
        // Safety: fresh block with `bytes` of payload room.
        unsafe {
            if pattern {
                Self::init_fill(ti, start, n);
            } else {
                ptr::write_bytes(start, 0, bytes);
            }
        }
        RawSlice::new(n, start)
    }

    /// Build a nested array of shape `dims`, innermost elements described
    /// by `ti` and zero-initialized.
    ///
    /// Outer levels are arrays of slice headers; the leaf level is
    /// [`Runtime::new_array`]. No dimensions yields a null slice.
    pub fn new_array_multi(&self, ti: &TypeDesc, dims: &[usize]) -> RawSlice {
        self.new_array_multi_impl(ti, dims, false)
    }

    /// [`Runtime::new_array_multi`] with pattern-initialized leaves.
    pub fn new_array_multi_init(&self, ti: &TypeDesc, dims: &[usize]) -> RawSlice {
        self.new_array_multi_impl(ti, dims, true)
    }

    fn new_array_multi_impl(&self, ti: &TypeDesc, dims: &[usize], pattern: bool) -> RawSlice {
        match dims {
            [] => RawSlice::null(),
            [n] => self.new_array_impl(ti, *n, pattern),
            [n, rest @ ..] => {
                let outer = self.new_array(&TypeDesc::slice_header(), *n);
                if outer.is_null() {
                    return outer;
                }
                let headers = outer.data as *mut RawSlice;
                for i in 0..*n {
                    let inner = self.new_array_multi_impl(ti, rest, pattern);
                    // Safety: `outer` holds `n` slice headers.
                    unsafe { headers.add(i).write(inner) };
                }
                outer
            }
        }
    }

    /// Allocate an array block for `n` elements the caller will fill.
    ///
    /// The used length covers the whole array up front, so the caller's
    /// stores need no further metadata updates.
    pub fn array_literal_alloc(&self, ti: &TypeDesc, n: usize) -> RawSlice {
        if n == 0 || ti.elem_size() == 0 {
            return RawSlice::null();
        }
        let bytes = checked_bytes(ti, n);
        let (_, start) = self.alloc_array_block(ti, bytes, bytes);
        RawSlice::new(n, start)
    }

    // =========================================================================
    // Length and capacity
    // =========================================================================

    /// Resize `slice` to `new_len` elements.
    ///
    /// Shrinking narrows the header only; block metadata is untouched so
    /// other slices keep their view of the block. Growing follows the
    /// grow skeleton with exact sizing and fills the new tail from the
    /// initializer template (zero when the template is empty).
    pub fn set_length(&self, ti: &TypeDesc, slice: &mut RawSlice, new_len: usize) {
        if new_len <= slice.len {
            slice.len = new_len;
            return;
        }
        if ti.elem_size() == 0 {
            slice.len = new_len;
            return;
        }
        let grown_by = new_len - slice.len;
        let tail = self.grow_raw(ti, slice, new_len, false);
        // Safety: grow_raw produced room for `grown_by` elements at `tail`.
        unsafe { Self::init_fill(ti, tail, grown_by) };
    }

    /// Ensure the backing block can hold at least `new_cap` elements from
    /// the slice's start; returns the capacity actually available there.
    ///
    /// Satisfied requests return without touching the block, so the call
    /// is idempotent. `new_cap == 0` is a pure query. A slice backed by a
    /// non-appendable block reports zero capacity and reallocates when
    /// asked for more.
    pub fn set_capacity(&self, ti: &TypeDesc, slice: &mut RawSlice, new_cap: usize) -> usize {
        let elem = ti.elem_size();
        if elem == 0 {
            return 0;
        }
        let req_bytes = checked_bytes(ti, new_cap);
        let len_bytes = checked_bytes(ti, slice.len);
        let shared = ti.is_shared();

        if !slice.data.is_null() {
            let (info, slot) = self.resolve_block(slice.data, shared);
            if !info.is_null() && info.attr.contains(BlkAttr::APPENDABLE) {
                let start = layout::array_start(&info) as usize;
                if slice.data as usize >= start {
                    let offset = slice.data as usize - start;
                    let avail = layout::usable_capacity(&info).saturating_sub(offset);
                    if new_cap == 0 || req_bytes <= avail {
                        return avail / elem;
                    }
                    if layout::is_large(info.size) {
                        // Safety: live appendable block.
                        let used = unsafe { meta::used_len(&info) };
                        if offset + len_bytes == used {
                            let needed = offset + req_bytes + LARGE_PAD - info.size;
                            let newsize = self.gc.extend(info.base, needed, needed + PAGE_SIZE);
                            if newsize != 0 {
                                RtStats::bump(&self.stats.blocks_extended);
                                let refreshed = BlkInfo {
                                    size: newsize,
                                    ..info
                                };
                                if !shared {
                                    cache::insert(refreshed, slot);
                                }
                                return (layout::usable_capacity(&refreshed) - offset) / elem;
                            }
                        }
                    }
                }
            }
        }
        if new_cap == 0 {
            return 0;
        }

        // Reallocate with exactly the requested room; the slice keeps its
        // length and becomes the new block's tail owner.
        let (info, start) = self.alloc_array_block(ti, len_bytes, req_bytes);
        if len_bytes != 0 {
            // Safety: old view stays readable; blocks are disjoint.
            unsafe { ptr::copy_nonoverlapping(slice.data, start, len_bytes) };
            RtStats::add(&self.stats.bytes_copied, len_bytes as u64);
        }
        slice.data = start;
        layout::usable_capacity(&info) / elem
    }

    /// Elements the slice's block can hold from the slice's start without
    /// reallocating. Zero for null slices and non-appendable backing.
    pub fn capacity(&self, ti: &TypeDesc, slice: &RawSlice) -> usize {
        let mut probe = *slice;
        self.set_capacity(ti, &mut probe, 0)
    }

    /// Pin the block's used length to exactly this slice's extent.
    ///
    /// The store is unconditional; the caller asserts no concurrent
    /// append is in flight. Appends through slices past the new used
    /// length will no longer own the tail and must reallocate.
    pub fn shrink_fit(&self, ti: &TypeDesc, slice: &RawSlice) {
        if slice.data.is_null() {
            return;
        }
        let (info, _) = self.resolve_block(slice.data, ti.is_shared());
        debug_assert!(
            !info.is_null() && info.attr.contains(BlkAttr::APPENDABLE),
            "shrink_fit on a non-appendable block"
        );
        if info.is_null() || !info.attr.contains(BlkAttr::APPENDABLE) {
            return;
        }
        let start = layout::array_start(&info) as usize;
        debug_assert!(slice.data as usize >= start);
        let offset = slice.data as usize - start;
        let used = offset + checked_bytes(ti, slice.len);
        // Safety: live appendable block.
        let ok = unsafe { meta::try_set_used(&info, used, ti.is_shared(), None) };
        debug_assert!(ok, "shrink_fit target exceeds block capacity");
    }

    // =========================================================================
    // Appending
    // =========================================================================

    /// Grow `slice` by `n` uninitialized elements and return a pointer to
    /// the first new element. The caller must initialize all `n`.
    ///
    /// Appending to a null slice allocates; the block is created
    /// appendable like any other array block.
    pub fn append_elems(&self, ti: &TypeDesc, slice: &mut RawSlice, n: usize) -> *mut u8 {
        if n == 0 {
            if slice.data.is_null() {
                return ptr::null_mut();
            }
            // Safety: end of the existing view.
            return unsafe { slice.data.add(checked_bytes(ti, slice.len)) };
        }
        let new_len = slice
            .len
            .checked_add(n)
            .unwrap_or_else(|| hooks::out_of_memory());
        self.grow_raw(ti, slice, new_len, true)
    }

    /// Append the contents of `rhs` to `slice`.
    ///
    /// `rhs` may alias `slice`, even partially: if growth relocates, the
    /// source block stays live under the collector, and if growth happens
    /// in place the copy is a memmove.
    pub fn append(&self, ti: &TypeDesc, slice: &mut RawSlice, rhs: RawSlice) {
        if rhs.len == 0 || ti.elem_size() == 0 {
            return;
        }
        debug_assert!(!rhs.data.is_null(), "non-empty slice without data");
        let src = rhs.data;
        let n_bytes = checked_bytes(ti, rhs.len);
        let tail = self.append_elems(ti, slice, rhs.len);
        // Safety: `tail` has room for `n_bytes`; `src` is readable for
        // the same (the pre-grow contents are untouched by the grow).
        unsafe { ptr::copy(src, tail, n_bytes) };
        RtStats::add(&self.stats.bytes_copied, n_bytes as u64);
    }

    /// Append one Unicode scalar to a UTF-8 string, encoding it into one
    /// to four bytes.
    ///
    /// String character data may be shared across threads, so the
    /// metadata update takes the locked path and skips the thread cache.
    pub fn append_char(&self, slice: &mut RawSlice, ch: char) {
        let mut buf = [0u8; 4];
        let encoded = ch.encode_utf8(&mut buf);
        let ti = TypeDesc::utf8_unit();
        let tail = self.append_elems(&ti, slice, encoded.len());
        // Safety: room for `encoded.len()` bytes at `tail`.
        unsafe { ptr::copy_nonoverlapping(encoded.as_ptr(), tail, encoded.len()) };
    }

    /// Append one Unicode scalar to a UTF-16 string, encoding it into one
    /// code unit or a surrogate pair.
    pub fn append_wchar(&self, slice: &mut RawSlice, ch: char) {
        let mut buf = [0u16; 2];
        let units = ch.encode_utf16(&mut buf);
        let ti = TypeDesc::utf16_unit();
        let tail = self.append_elems(&ti, slice, units.len()) as *mut u16;
        for (i, unit) in units.iter().enumerate() {
            // Safety: room for `units.len()` code units at `tail`.
            unsafe { tail.add(i).write_unaligned(*unit) };
        }
    }

    // =========================================================================
    // Copying combinators
    // =========================================================================

    /// Concatenate two slices into a fresh array sized exactly to the
    /// combined length.
    pub fn concat(&self, ti: &TypeDesc, x: RawSlice, y: RawSlice) -> RawSlice {
        self.concat_n(ti, &[x, y])
    }

    /// Concatenate any number of slices into a fresh array sized exactly
    /// to the combined length.
    pub fn concat_n(&self, ti: &TypeDesc, parts: &[RawSlice]) -> RawSlice {
        let elem = ti.elem_size();
        if elem == 0 {
            return RawSlice::null();
        }
        let mut byte_counts: SmallVec<[usize; 8]> = SmallVec::with_capacity(parts.len());
        let mut total: usize = 0;
        for part in parts {
            let bytes = checked_bytes(ti, part.len);
            byte_counts.push(bytes);
            total = total
                .checked_add(bytes)
                .unwrap_or_else(|| hooks::out_of_memory());
        }
        if total == 0 {
            return RawSlice::null();
        }
        let (_, start) = self.alloc_array_block(ti, total, total);
        let mut at = start;
        for (part, &bytes) in parts.iter().zip(&byte_counts) {
            if bytes != 0 {
                debug_assert!(!part.data.is_null(), "non-empty slice without data");
                // Safety: `start` has room for `total`; inputs are
                // readable for their byte counts.
                unsafe {
                    ptr::copy_nonoverlapping(part.data, at, bytes);
                    at = at.add(bytes);
                }
            }
        }
        RtStats::add(&self.stats.bytes_copied, total as u64);
        RawSlice::new(total / elem, start)
    }

    /// Copy `slice` into a fresh block of exactly its size.
    pub fn dup(&self, ti: &TypeDesc, slice: RawSlice) -> RawSlice {
        let bytes = checked_bytes(ti, slice.len);
        if bytes == 0 || ti.elem_size() == 0 {
            return RawSlice::null();
        }
        debug_assert!(!slice.data.is_null(), "non-empty slice without data");
        let (_, start) = self.alloc_array_block(ti, bytes, bytes);
        // Safety: disjoint fresh block sized for `bytes`.
        unsafe { ptr::copy_nonoverlapping(slice.data, start, bytes) };
        RtStats::add(&self.stats.bytes_copied, bytes as u64);
        RawSlice::new(slice.len, start)
    }

    // =========================================================================
    // Disposal
    // =========================================================================

    /// Release an array's backing block without waiting for a collection.
    ///
    /// Only a slice that starts at the block's array start may dispose of
    /// it; anything else nulls the header and leaves the block to the
    /// collector. The thread cache entry is dropped first so the recycled
    /// address cannot resolve through it later.
    pub fn delete_array(&self, slice: &mut RawSlice) {
        if !slice.data.is_null() {
            let info = self.gc.query(slice.data);
            if !info.is_null() && layout::array_start(&info) == slice.data {
                cache::evict(info.base);
                self.gc.free(info.base);
            }
        }
        *slice = RawSlice::null();
    }
}
