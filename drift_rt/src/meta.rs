//! In-band used-length metadata.
//!
//! Every appendable block records how many payload bytes have ever been
//! claimed through any slice of that block. A slice whose end coincides
//! with this value owns the tail and may grow in place; everyone else
//! must reallocate. The field's position and width follow the block's
//! size class (see [`crate::layout`]).
//!
//! Non-shared element types update the field with a plain read-compare-
//! write: only the owning thread may legitimately be growing that slice,
//! so the compare catches stealing by *other slices*, not other threads.
//! Shared element types serialize the whole compare-and-set under one
//! process-wide lock.

use crate::layout::{self, SizeClass};
use drift_gc::BlkInfo;
use parking_lot::Mutex;

/// Serializes used-length updates for shared element types. One coarse
/// lock for all shared arrays; metadata updates are rare relative to
/// element access.
static SHARED_META_LOCK: Mutex<()> = Mutex::new(());

/// Read the block's used length in payload bytes.
///
/// # Safety
///
/// `info` must describe a live appendable block.
#[inline]
pub unsafe fn used_len(info: &BlkInfo) -> usize {
    match SizeClass::of(info.size) {
        SizeClass::Small => *info.base.add(info.size - 1) as usize,
        SizeClass::Medium => {
            (info.base.add(info.size - 2) as *const u16).read_unaligned() as usize
        }
        SizeClass::Large => (info.base as *const usize).read(),
    }
}

/// Install the used length of a freshly allocated block.
///
/// No competing slice exists at creation time, so the store is
/// unconditional and unlocked. Large blocks also get their end sentinel
/// zeroed here.
///
/// # Safety
///
/// `info` must describe a live block this thread just allocated.
pub unsafe fn init_used(info: &BlkInfo, used: usize) {
    debug_assert!(used + layout::pad_for_block(info.size) <= info.size);
    match SizeClass::of(info.size) {
        SizeClass::Small => *info.base.add(info.size - 1) = used as u8,
        SizeClass::Medium => {
            (info.base.add(info.size - 2) as *mut u16).write_unaligned(used as u16)
        }
        SizeClass::Large => {
            (info.base as *mut usize).write(used);
            *info.base.add(info.size - 1) = 0;
        }
    }
}

/// Try to move the block's used length to `new_used`.
///
/// With `expected`, the write succeeds only while the field still holds
/// that value; a mismatch means another slice claimed the tail first and
/// the caller must reallocate. Without `expected` the write is
/// unconditional.
///
/// Returns false on mismatch, and also when `new_used` plus the block's
/// metadata pad does not fit: the caller should then try extension or
/// reallocation.
pub unsafe fn try_set_used(
    info: &BlkInfo,
    new_used: usize,
    shared: bool,
    expected: Option<usize>,
) -> bool {
    if new_used + layout::pad_for_block(info.size) > info.size {
        return false;
    }
    if shared {
        let _guard = SHARED_META_LOCK.lock();
        set_if_matches(info, new_used, expected)
    } else {
        set_if_matches(info, new_used, expected)
    }
}

unsafe fn set_if_matches(info: &BlkInfo, new_used: usize, expected: Option<usize>) -> bool {
    match SizeClass::of(info.size) {
        SizeClass::Small => {
            debug_assert!(new_used <= u8::MAX as usize);
            let field = info.base.add(info.size - 1);
            if let Some(old) = expected {
                if *field as usize != old {
                    return false;
                }
            }
            *field = new_used as u8;
        }
        SizeClass::Medium => {
            debug_assert!(new_used <= u16::MAX as usize);
            let field = info.base.add(info.size - 2) as *mut u16;
            if let Some(old) = expected {
                if field.read_unaligned() as usize != old {
                    return false;
                }
            }
            field.write_unaligned(new_used as u16);
        }
        SizeClass::Large => {
            let field = info.base as *mut usize;
            if let Some(old) = expected {
                if field.read() != old {
                    return false;
                }
            }
            field.write(new_used);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_gc::BlkAttr;
    use std::alloc::Layout;

    /// An aligned buffer standing in for a GC block.
    struct TestBlock {
        info: BlkInfo,
        layout: Layout,
    }

    impl TestBlock {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, 16).expect("bad layout");
            let base = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!base.is_null());
            Self {
                info: BlkInfo {
                    base,
                    size,
                    attr: BlkAttr::APPENDABLE,
                },
                layout,
            }
        }
    }

    impl Drop for TestBlock {
        fn drop(&mut self) {
            unsafe { std::alloc::dealloc(self.info.base, self.layout) };
        }
    }

    #[test]
    fn test_small_block_roundtrip() {
        let blk = TestBlock::new(64);
        unsafe {
            init_used(&blk.info, 12);
            assert_eq!(used_len(&blk.info), 12);
            // Field sits in the last byte.
            assert_eq!(*blk.info.base.add(63), 12);
        }
    }

    #[test]
    fn test_medium_block_roundtrip() {
        let blk = TestBlock::new(1024);
        unsafe {
            init_used(&blk.info, 1000);
            assert_eq!(used_len(&blk.info), 1000);
        }
    }

    #[test]
    fn test_large_block_roundtrip_and_sentinel() {
        let blk = TestBlock::new(8192);
        unsafe {
            *blk.info.base.add(8191) = 0xff;
            init_used(&blk.info, 5000);
            assert_eq!(used_len(&blk.info), 5000);
            // Sentinel byte at the end is zeroed for live blocks.
            assert_eq!(*blk.info.base.add(8191), 0);
        }
    }

    #[test]
    fn test_cas_mismatch_leaves_field() {
        let blk = TestBlock::new(64);
        unsafe {
            init_used(&blk.info, 8);
            assert!(!try_set_used(&blk.info, 16, false, Some(4)));
            assert_eq!(used_len(&blk.info), 8);
            assert!(try_set_used(&blk.info, 16, false, Some(8)));
            assert_eq!(used_len(&blk.info), 16);
        }
    }

    #[test]
    fn test_no_room_fails() {
        let blk = TestBlock::new(64);
        unsafe {
            init_used(&blk.info, 8);
            // 64-byte block keeps one pad byte: 63 is the ceiling.
            assert!(!try_set_used(&blk.info, 64, false, Some(8)));
            assert!(try_set_used(&blk.info, 63, false, Some(8)));
        }
    }

    #[test]
    fn test_unconditional_set() {
        let blk = TestBlock::new(64);
        unsafe {
            init_used(&blk.info, 32);
            assert!(try_set_used(&blk.info, 4, false, None));
            assert_eq!(used_len(&blk.info), 4);
        }
    }

    #[test]
    fn test_shared_path_serializes() {
        let blk = TestBlock::new(64);
        unsafe {
            init_used(&blk.info, 0);
        }
        // Two contenders race from the same expected value; exactly one
        // may win.
        let info = &blk.info;
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|i| {
                    s.spawn(move || unsafe { try_set_used(info, 8 + i, true, Some(0)) })
                })
                .collect();
            let wins: usize = handles
                .into_iter()
                .map(|h| h.join().expect("thread panicked") as usize)
                .sum();
            assert_eq!(wins, 1);
        });
    }
}
