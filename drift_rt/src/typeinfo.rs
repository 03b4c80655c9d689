//! Element type descriptors.
//!
//! Array operations are type-erased: everything they need to know about
//! an element type travels in a `TypeDesc`.

use crate::slice::RawSlice;
use bitflags::bitflags;
use drift_gc::BlkAttr;

bitflags! {
    /// Properties of an element type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u32 {
        /// Elements contain pointers the collector must scan.
        const HAS_POINTERS = 1 << 0;
        /// The type is shared-qualified: slices of it may be appended from
        /// multiple threads, so metadata updates serialize under the
        /// process-wide lock and skip the per-thread cache.
        const SHARED = 1 << 1;
    }
}

/// Description of an array element type: size, scanning and sharing
/// properties, and the initializer template.
#[derive(Debug, Clone)]
pub struct TypeDesc {
    elem_size: usize,
    flags: TypeFlags,
    init: Box<[u8]>,
}

impl TypeDesc {
    /// A plain element type, zero-initialized by default.
    pub fn new(elem_size: usize) -> Self {
        Self {
            elem_size,
            flags: TypeFlags::empty(),
            init: Box::default(),
        }
    }

    /// Attach an initializer template. Its length must equal the element
    /// size; fresh elements are stamped from it instead of zeroed.
    pub fn with_init(mut self, template: &[u8]) -> Self {
        debug_assert!(template.len() == self.elem_size);
        self.init = template.into();
        self
    }

    /// Mark the element type as containing pointers.
    pub fn pointers(mut self) -> Self {
        self.flags |= TypeFlags::HAS_POINTERS;
        self
    }

    /// Mark the element type as shared-qualified.
    pub fn shared(mut self) -> Self {
        self.flags |= TypeFlags::SHARED;
        self
    }

    /// Descriptor for nested slice headers (arrays of arrays).
    pub fn slice_header() -> Self {
        Self::new(std::mem::size_of::<RawSlice>()).pointers()
    }

    /// UTF-8 code unit of a string; character data may be shared.
    pub(crate) fn utf8_unit() -> Self {
        Self::new(1).shared()
    }

    /// UTF-16 code unit of a wide string; character data may be shared.
    pub(crate) fn utf16_unit() -> Self {
        Self::new(2).shared()
    }

    /// Element size in bytes.
    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Whether elements contain pointers.
    #[inline]
    pub fn has_pointers(&self) -> bool {
        self.flags.contains(TypeFlags::HAS_POINTERS)
    }

    /// Whether the type is shared-qualified.
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.flags.contains(TypeFlags::SHARED)
    }

    /// Initializer template; empty means zero-initialize.
    #[inline]
    pub fn init_template(&self) -> &[u8] {
        &self.init
    }

    /// Attribute bits for a fresh array block of this type.
    pub(crate) fn block_attrs(&self) -> BlkAttr {
        let mut attr = BlkAttr::APPENDABLE;
        if !self.has_pointers() {
            attr |= BlkAttr::NO_SCAN;
        }
        attr
    }
}
