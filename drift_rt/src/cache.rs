//! Per-thread block-descriptor cache.
//!
//! Asking the collector to resolve an interior pointer on every operation
//! is expensive, so each thread keeps the last few descriptors it
//! resolved in a small associative cache. Entries must not outlive their
//! blocks: the collector's sweep hook walks every thread's cache between
//! mark and sweep and zeroes entries whose block is about to be
//! reclaimed.
//!
//! Caches live in a process-wide registry rather than at a fixed TLS
//! offset: a thread registers its cache on first use and unregisters on
//! exit, and [`process_gc_marks`] iterates the registry. The hook runs
//! under the collector's stop-the-world discipline, which is the only
//! thing that makes the cross-thread access sound.

use drift_gc::{BlkAttr, BlkInfo};
use parking_lot::Mutex;
use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Cache slots per thread. Power of two; indexing is mask arithmetic.
pub const N_CACHE_BLOCKS: usize = 8;

const INDEX_MASK: usize = N_CACHE_BLOCKS - 1;

/// One cached descriptor.
///
/// `base` is atomic because the sweep hook zeroes it from another thread;
/// `size` and `attr` are only ever touched by the owning thread, and only
/// read by anyone else while the owner is stopped.
struct CacheEntry {
    base: AtomicPtr<u8>,
    size: Cell<usize>,
    attr: Cell<BlkAttr>,
}

impl CacheEntry {
    fn empty() -> Self {
        Self {
            base: AtomicPtr::new(ptr::null_mut()),
            size: Cell::new(0),
            attr: Cell::new(BlkAttr::empty()),
        }
    }
}

/// A thread's block-descriptor cache.
struct BlkCache {
    entries: [CacheEntry; N_CACHE_BLOCKS],
    head: Cell<usize>,
}

// Safety: the owning thread is the sole mutator. The sweep hook on
// another thread loads and zeroes `base` (atomic) strictly while the
// owner is suspended at a collection safepoint.
unsafe impl Sync for BlkCache {}

impl BlkCache {
    fn new() -> Self {
        Self {
            entries: std::array::from_fn(|_| CacheEntry::empty()),
            head: Cell::new(0),
        }
    }

    fn entry_hit(&self, i: usize, interior: *const u8) -> Option<BlkInfo> {
        let entry = &self.entries[i];
        let base = entry.base.load(Ordering::Relaxed);
        if base.is_null() {
            return None;
        }
        let size = entry.size.get();
        let addr = interior as usize;
        if addr >= base as usize && addr < base as usize + size {
            Some(BlkInfo {
                base,
                size,
                attr: entry.attr.get(),
            })
        } else {
            None
        }
    }

    /// Find the entry containing `interior`.
    ///
    /// Scans from the newest insertion downward, then wraps from the top,
    /// so hot blocks resolve in the first probe or two.
    fn find(&self, interior: *const u8) -> Option<(BlkInfo, usize)> {
        let head = self.head.get();
        for i in (0..=head).rev() {
            if let Some(info) = self.entry_hit(i, interior) {
                return Some((info, i));
            }
        }
        for i in (head + 1..N_CACHE_BLOCKS).rev() {
            if let Some(info) = self.entry_hit(i, interior) {
                return Some((info, i));
            }
        }
        None
    }

    fn read_slot(&self, i: usize) -> BlkInfo {
        let entry = &self.entries[i];
        BlkInfo {
            base: entry.base.load(Ordering::Relaxed),
            size: entry.size.get(),
            attr: entry.attr.get(),
        }
    }

    fn write_slot(&self, i: usize, info: BlkInfo) {
        let entry = &self.entries[i];
        entry.size.set(info.size);
        entry.attr.set(info.attr);
        entry.base.store(info.base, Ordering::Relaxed);
    }

    /// Install `info` and return the slot it landed in.
    ///
    /// Refreshing a slot a previous `find` hit promotes that block to the
    /// head: the head's old descriptor moves into the hit slot, the head
    /// advances, and `info` is written there. A plain insert advances the
    /// head and evicts whatever was in it.
    fn insert(&self, info: BlkInfo, hit: Option<usize>) -> usize {
        let head = self.head.get();
        match hit {
            Some(i) if i == head => {
                self.write_slot(head, info);
                head
            }
            Some(i) => {
                self.write_slot(i, self.read_slot(head));
                let new_head = (head + 1) & INDEX_MASK;
                self.head.set(new_head);
                self.write_slot(new_head, info);
                new_head
            }
            None => {
                let new_head = (head + 1) & INDEX_MASK;
                self.head.set(new_head);
                self.write_slot(new_head, info);
                new_head
            }
        }
    }

    /// Drop the entry for `base`, if cached.
    fn evict(&self, base: *mut u8) {
        for entry in &self.entries {
            if entry.base.load(Ordering::Relaxed) == base {
                entry.base.store(ptr::null_mut(), Ordering::Relaxed);
            }
        }
    }

    fn purge(&self) {
        for entry in &self.entries {
            entry.base.store(ptr::null_mut(), Ordering::Relaxed);
        }
    }
}

/// Registry entry; dereferenced only during stop-the-world or removed by
/// the owning thread itself.
struct CachePtr(*const BlkCache);

// Safety: see `CachePtr` docs; the pointee outlives its registry entry
// because unregistration happens in the owner's TLS destructor.
unsafe impl Send for CachePtr {}

static REGISTRY: Mutex<Vec<CachePtr>> = Mutex::new(Vec::new());

/// Owns a thread's cache; registers on creation, unregisters on thread
/// exit.
struct CacheGuard {
    cache: Box<BlkCache>,
}

impl CacheGuard {
    fn new() -> Self {
        let cache = Box::new(BlkCache::new());
        REGISTRY.lock().push(CachePtr(&*cache as *const BlkCache));
        Self { cache }
    }
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        let target = &*self.cache as *const BlkCache;
        REGISTRY.lock().retain(|p| !ptr::eq(p.0, target));
    }
}

thread_local! {
    static TLS_CACHE: CacheGuard = CacheGuard::new();
}

fn with_cache<R>(f: impl FnOnce(&BlkCache) -> R) -> Option<R> {
    // During thread teardown the cache may already be gone; behave as a
    // miss rather than touching a dead TLS slot.
    TLS_CACHE.try_with(|guard| f(&guard.cache)).ok()
}

/// Probe the current thread's cache for the block containing `interior`.
///
/// Returns the descriptor and the slot it was found in; pass the slot to
/// [`insert`] when refreshing the same block's descriptor.
pub fn find(interior: *const u8) -> Option<(BlkInfo, usize)> {
    with_cache(|c| c.find(interior)).flatten()
}

/// Install a descriptor in the current thread's cache. Returns the slot
/// written, or `None` during thread teardown.
pub fn insert(info: BlkInfo, hit: Option<usize>) -> Option<usize> {
    with_cache(|c| c.insert(info, hit))
}

/// Drop the current thread's entry for `base`, if any. Used when a block
/// is released outside the sweep protocol (explicit disposal).
pub fn evict(base: *mut u8) {
    let _ = with_cache(|c| c.evict(base));
}

/// Drop every descriptor cached by the current thread.
///
/// For embedders that release whole heaps outside the collector's sweep
/// (tests, explicit teardown): a recycled block address must not resolve
/// through a stale entry.
pub fn purge() {
    let _ = with_cache(|c| c.purge());
}

/// Sweep hook: invalidate cached descriptors for blocks about to be
/// reclaimed.
///
/// The collector calls this after marking and before sweeping, with every
/// mutator stopped. `is_collecting` is the collector's predicate over
/// block bases.
pub fn process_gc_marks(is_collecting: &mut dyn FnMut(*mut u8) -> bool) {
    let registry = REGISTRY.lock();
    for cache_ptr in registry.iter() {
        // Safety: registered caches are live (unregistration is the
        // owner's TLS destructor) and their owners are stopped.
        let cache = unsafe { &*cache_ptr.0 };
        for entry in &cache.entries {
            let base = entry.base.load(Ordering::Relaxed);
            if !base.is_null() && is_collecting(base) {
                entry.base.store(ptr::null_mut(), Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(base: usize, size: usize) -> BlkInfo {
        BlkInfo {
            base: base as *mut u8,
            size,
            attr: BlkAttr::APPENDABLE,
        }
    }

    /// Cache state is thread-local; run each test body on its own thread
    /// so fabricated addresses never mix with other tests' caches.
    fn on_fresh_thread(f: impl FnOnce() + Send) {
        std::thread::scope(|s| {
            s.spawn(f).join().expect("test thread panicked");
        });
    }

    #[test]
    fn test_find_after_insert() {
        on_fresh_thread(|| {
            insert(info(0x10_0000, 64), None);
            let (found, _) = find(0x10_0020 as *const u8).expect("expected hit");
            assert_eq!(found.base as usize, 0x10_0000);
            assert_eq!(found.size, 64);
            assert!(find(0x10_0040 as *const u8).is_none());
            assert!(find(0xf_ffff as *const u8).is_none());
        });
    }

    #[test]
    fn test_eviction_drops_oldest() {
        on_fresh_thread(|| {
            for i in 0..N_CACHE_BLOCKS + 1 {
                insert(info(0x20_0000 + i * 0x1000, 64), None);
            }
            // First insert has been evicted; the rest are resolvable.
            assert!(find(0x20_0000 as *const u8).is_none());
            assert!(find((0x20_0000 + 0x1000) as *const u8).is_some());
            assert!(find((0x20_0000 + N_CACHE_BLOCKS * 0x1000) as *const u8).is_some());
        });
    }

    #[test]
    fn test_refresh_promotes_to_head() {
        on_fresh_thread(|| {
            insert(info(0x30_0000, 64), None);
            for i in 1..4 {
                insert(info(0x30_0000 + i * 0x1000, 64), None);
            }
            let (hit, slot) = find(0x30_0000 as *const u8).expect("expected hit");
            let promoted = insert(BlkInfo { size: 128, ..hit }, Some(slot)).expect("insert");
            // The refreshed descriptor is at the head and readable.
            let (found, again) = find(0x30_0000 as *const u8).expect("expected hit");
            assert_eq!(found.size, 128);
            assert_eq!(again, promoted);
        });
    }

    #[test]
    fn test_sweep_hook_zeroes_condemned() {
        on_fresh_thread(|| {
            insert(info(0x40_0000, 64), None);
            insert(info(0x40_1000, 64), None);
            process_gc_marks(&mut |base| base as usize == 0x40_0000);
            assert!(find(0x40_0000 as *const u8).is_none());
            assert!(find(0x40_1000 as *const u8).is_some());
        });
    }

    #[test]
    fn test_evict_single_block() {
        on_fresh_thread(|| {
            insert(info(0x50_0000, 64), None);
            insert(info(0x50_1000, 64), None);
            evict(0x50_0000 as *mut u8);
            assert!(find(0x50_0000 as *const u8).is_none());
            assert!(find(0x50_1000 as *const u8).is_some());
        });
    }

    #[test]
    fn test_thread_exit_unregisters() {
        let before = REGISTRY.lock().len();
        let registered = std::thread::spawn(|| {
            insert(info(0x60_0000, 64), None);
            TLS_CACHE.with(|g| &*g.cache as *const BlkCache as usize)
        })
        .join()
        .expect("thread panicked");

        let registry = REGISTRY.lock();
        assert!(registry.iter().all(|p| p.0 as usize != registered));
        assert!(registry.len() <= before + 1);
    }
}
