//! Block layout: where array metadata lives inside a block.
//!
//! Appendable blocks carry their used-length field in a size-class-
//! dependent position:
//!
//! | Block size `S`    | Field         | Position          |
//! |-------------------|---------------|-------------------|
//! | `S <= 256`        | 1 byte        | `base + S - 1`    |
//! | `256 < S < 4096`  | 2 bytes       | `base + S - 2`    |
//! | `S >= 4096`       | machine word  | `base + 0`        |
//!
//! Page-sized blocks reserve a 16-byte prefix so the payload stays
//! aligned, and keep one zero byte at the very end so a pointer one past
//! the payload cannot be mistaken for a pointer into the next block.

use drift_gc::BlkInfo;

/// Page size assumed by the size-class scheme.
pub const PAGE_SIZE: usize = 4096;

/// Metadata overhead of a small block: one trailing length byte.
pub const SMALL_PAD: usize = 1;
/// Metadata overhead of a medium block: two trailing length bytes.
pub const MEDIUM_PAD: usize = 2;
/// Prefix reserved at the front of a large block, sized for alignment.
pub const LARGE_PREFIX: usize = 16;
/// Metadata overhead of a large block: the prefix plus the end sentinel.
pub const LARGE_PAD: usize = LARGE_PREFIX + 1;

/// Largest payload a small block can carry.
pub const MAX_SMALL_SIZE: usize = 256 - SMALL_PAD;
/// Largest payload a medium block can carry.
pub const MAX_MEDIUM_SIZE: usize = PAGE_SIZE / 2 - MEDIUM_PAD;

/// Size class of a block, derived from its total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// Up to 256 bytes.
    Small,
    /// Up to a page.
    Medium,
    /// One page and beyond.
    Large,
}

impl SizeClass {
    /// Classify a block by its total size.
    #[inline]
    pub fn of(block_size: usize) -> Self {
        if block_size & !(PAGE_SIZE - 1) != 0 {
            SizeClass::Large
        } else if block_size <= MAX_SMALL_SIZE + SMALL_PAD {
            SizeClass::Small
        } else {
            SizeClass::Medium
        }
    }
}

/// Whether a block of this total size uses the large layout.
#[inline]
pub fn is_large(block_size: usize) -> bool {
    block_size & !(PAGE_SIZE - 1) != 0
}

/// Overhead to add to a fresh allocation request of `payload` bytes.
///
/// Takes the payload size, not an existing block size: the result is the
/// pad the block will need once the payload is stored in it.
#[inline]
pub fn array_pad(payload: usize) -> usize {
    if payload > MAX_MEDIUM_SIZE {
        LARGE_PAD
    } else if payload > MAX_SMALL_SIZE {
        MEDIUM_PAD
    } else {
        SMALL_PAD
    }
}

/// Metadata overhead of an existing block of `block_size` total bytes.
#[inline]
pub fn pad_for_block(block_size: usize) -> usize {
    match SizeClass::of(block_size) {
        SizeClass::Small => SMALL_PAD,
        SizeClass::Medium => MEDIUM_PAD,
        SizeClass::Large => LARGE_PAD,
    }
}

/// First payload byte of an array block.
#[inline]
pub fn array_start(info: &BlkInfo) -> *mut u8 {
    if is_large(info.size) {
        // Safety: LARGE_PREFIX is within the block (size >= PAGE_SIZE).
        unsafe { info.base.add(LARGE_PREFIX) }
    } else {
        info.base
    }
}

/// Payload bytes the block can hold, net of metadata.
#[inline]
pub fn usable_capacity(info: &BlkInfo) -> usize {
    info.size - pad_for_block(info.size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_gc::BlkAttr;

    #[test]
    fn test_array_pad_boundaries() {
        assert_eq!(array_pad(0), SMALL_PAD);
        assert_eq!(array_pad(MAX_SMALL_SIZE), SMALL_PAD);
        assert_eq!(array_pad(MAX_SMALL_SIZE + 1), MEDIUM_PAD);
        assert_eq!(array_pad(MAX_MEDIUM_SIZE), MEDIUM_PAD);
        assert_eq!(array_pad(MAX_MEDIUM_SIZE + 1), LARGE_PAD);
        assert_eq!(array_pad(100_000), LARGE_PAD);
    }

    #[test]
    fn test_size_class_of() {
        assert_eq!(SizeClass::of(16), SizeClass::Small);
        assert_eq!(SizeClass::of(256), SizeClass::Small);
        assert_eq!(SizeClass::of(257), SizeClass::Medium);
        assert_eq!(SizeClass::of(2048), SizeClass::Medium);
        assert_eq!(SizeClass::of(PAGE_SIZE), SizeClass::Large);
        assert_eq!(SizeClass::of(3 * PAGE_SIZE), SizeClass::Large);
    }

    #[test]
    fn test_array_start_offsets() {
        let small = BlkInfo {
            base: 0x1000 as *mut u8,
            size: 64,
            attr: BlkAttr::APPENDABLE,
        };
        assert_eq!(array_start(&small) as usize, 0x1000);

        let large = BlkInfo {
            base: 0x10000 as *mut u8,
            size: 2 * PAGE_SIZE,
            attr: BlkAttr::APPENDABLE,
        };
        assert_eq!(array_start(&large) as usize, 0x10000 + LARGE_PREFIX);
    }

    #[test]
    fn test_usable_capacity() {
        let info = |size| BlkInfo {
            base: 0x1000 as *mut u8,
            size,
            attr: BlkAttr::APPENDABLE,
        };
        assert_eq!(usable_capacity(&info(16)), 15);
        assert_eq!(usable_capacity(&info(256)), 255);
        assert_eq!(usable_capacity(&info(1024)), 1022);
        assert_eq!(usable_capacity(&info(PAGE_SIZE)), PAGE_SIZE - LARGE_PAD);
    }
}
