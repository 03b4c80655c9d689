//! Class instance lifecycle.
//!
//! Independent of the array machinery; talks only to the collector.
//! Instances start with a two-word header (vtable pointer, then monitor
//! pointer), and the vtable's first slot identifies the class, which is
//! how finalization recovers the destructor chain from a bare pointer.

use crate::Runtime;
use bitflags::bitflags;
use drift_gc::{hooks, BlkAttr, GcHeap};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

bitflags! {
    /// Allocation and layout flags of a class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassFlags: u32 {
        /// Instances are reference-counted and live on the C heap, not in
        /// the collector.
        const REF_COUNTED = 1 << 0;
        /// Instances contain no pointers the collector must scan.
        const NO_POINTERS = 1 << 1;
    }
}

/// Destructor entry point for one class level.
///
/// # Safety
///
/// Receives a pointer to a live instance of the class (or a derived one)
/// it was registered for.
pub type Destructor = unsafe fn(*mut u8);

/// Monitor teardown primitive installed by the host runtime.
pub type MonitorDelete = unsafe fn(*mut u8);

/// The capability set finalization walks: a name for diagnostics, a link
/// to the base class, and an optional destructor. Class descriptors
/// implement this; nothing in finalization depends on a concrete
/// descriptor type.
pub trait ClassShape {
    /// Class name, for error reporting.
    fn name(&self) -> &str;
    /// Base class, if any.
    fn base(&self) -> Option<&dyn ClassShape>;
    /// Destructor for this level of the hierarchy, if any.
    fn destructor(&self) -> Option<Destructor>;
}

/// Static description of a class.
pub struct ClassInfo {
    /// Class name.
    pub name: &'static str,
    /// Initializer image copied into every fresh instance; its length is
    /// the instance size. The image's leading words are the header, with
    /// the vtable pointer already in place.
    pub init: &'static [u8],
    /// Allocation and layout flags.
    pub flags: ClassFlags,
    /// Base class.
    pub base: Option<&'static ClassInfo>,
    /// Destructor for this level.
    pub dtor: Option<Destructor>,
    /// Custom deallocator used by explicit delete instead of `gc.free`.
    pub dealloc: Option<unsafe fn(*mut u8)>,
}

impl ClassShape for ClassInfo {
    fn name(&self) -> &str {
        self.name
    }

    fn base(&self) -> Option<&dyn ClassShape> {
        self.base.map(|b| b as &dyn ClassShape)
    }

    fn destructor(&self) -> Option<Destructor> {
        self.dtor
    }
}

/// First slot of a class vtable. Method entries follow in whatever layout
/// the compiler emits; the runtime only reads slot 0.
#[repr(C)]
pub struct VTable {
    /// The class this vtable belongs to.
    pub class: *const ClassInfo,
}

// Safety: a vtable is immutable static data.
unsafe impl Sync for VTable {}

/// Leading words of every class instance.
#[repr(C)]
pub struct ObjectHeader {
    /// Slot 0: vtable pointer; null once the object is finalized.
    pub vtable: *const VTable,
    /// Slot 1: monitor pointer, null when no monitor was ever taken.
    pub monitor: *mut u8,
}

// =============================================================================
// Process-wide hooks
// =============================================================================

/// Filter consulted before running destructor chains during collection.
/// Returning false skips the chain for that object. Deterministic
/// destruction (explicit delete) is never filtered.
pub type CollectHandler = fn(obj: *mut u8) -> bool;

static COLLECT_HANDLER: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static MONITOR_DELETE: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Install or clear the process-wide collect handler. Last writer wins.
pub fn set_collect_handler(handler: Option<CollectHandler>) {
    let raw = match handler {
        Some(h) => h as *mut (),
        None => ptr::null_mut(),
    };
    COLLECT_HANDLER.store(raw, Ordering::Release);
}

/// The currently installed collect handler.
pub fn collect_handler() -> Option<CollectHandler> {
    let raw = COLLECT_HANDLER.load(Ordering::Acquire);
    if raw.is_null() {
        None
    } else {
        // Safety: only ever stored from a `CollectHandler`.
        Some(unsafe { mem::transmute::<*mut (), CollectHandler>(raw) })
    }
}

/// Install the monitor teardown primitive.
pub fn set_monitor_delete(f: MonitorDelete) {
    MONITOR_DELETE.store(f as *mut (), Ordering::Release);
}

fn delete_monitor(monitor: *mut u8) {
    let raw = MONITOR_DELETE.load(Ordering::Acquire);
    if !raw.is_null() {
        // Safety: only ever stored from a `MonitorDelete`.
        let f: MonitorDelete = unsafe { mem::transmute(raw) };
        unsafe { f(monitor) };
    }
}

/// Clears an object's vtable slot when dropped, no matter how
/// finalization exits.
struct VTableClear(*mut ObjectHeader);

impl Drop for VTableClear {
    fn drop(&mut self) {
        unsafe { (*self.0).vtable = ptr::null() };
    }
}

impl<'gc> Runtime<'gc> {
    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate and initialize an instance of `class`.
    ///
    /// Reference-counted classes live on the C heap and are owned by
    /// their reference count; all other instances are collector blocks
    /// flagged for finalization.
    pub fn alloc_instance(&self, class: &ClassInfo) -> *mut u8 {
        let size = class.init.len();
        let p = if class.flags.contains(ClassFlags::REF_COUNTED) {
            let p = unsafe { libc::malloc(size) as *mut u8 };
            if p.is_null() {
                hooks::out_of_memory();
            }
            p
        } else {
            let mut attr = BlkAttr::FINALIZE;
            if class.flags.contains(ClassFlags::NO_POINTERS) {
                attr |= BlkAttr::NO_SCAN;
            }
            match self.gc.malloc(size, attr) {
                Some(p) => p.as_ptr(),
                None => hooks::out_of_memory(),
            }
        };
        // Safety: `p` spans `size` bytes; the image is exactly that long.
        unsafe { ptr::copy_nonoverlapping(class.init.as_ptr(), p, size) };
        p
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Run an object's finalization protocol.
    ///
    /// Walks the destructor chain derived-to-base, deletes the monitor,
    /// restores the initializer image, and clears the vtable slot. The
    /// clear happens even if a destructor or the error sink panics. A
    /// panicking destructor aborts the rest of the chain, is reported
    /// through [`hooks::finalize_error`], and finalization continues with
    /// monitor and memory cleanup.
    ///
    /// `det` marks deterministic destruction (explicit delete); the
    /// process-wide collect handler is only consulted when it is false.
    ///
    /// An object whose vtable slot is already null is left untouched.
    ///
    /// # Safety
    ///
    /// `p` must point to an instance laid out with a leading
    /// [`ObjectHeader`] whose vtable, when non-null, leads to a live
    /// [`ClassInfo`].
    pub unsafe fn finalize(&self, p: *mut u8, det: bool) {
        let header = p as *mut ObjectHeader;
        let vtable = (*header).vtable;
        if vtable.is_null() {
            return;
        }
        let class = &*(*vtable).class;

        let guard = VTableClear(header);

        let run_chain = det || collect_handler().map_or(true, |h| h(p));
        if run_chain {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut level: Option<&dyn ClassShape> = Some(class);
                while let Some(c) = level {
                    if let Some(dtor) = c.destructor() {
                        // Safety: `p` is an instance of the most-derived
                        // class, which inherits from `c`.
                        unsafe { dtor(p) };
                    }
                    level = c.base();
                }
            }));
            if let Err(payload) = outcome {
                hooks::finalize_error(class.name, payload.as_ref());
            }
        }

        let monitor = (*header).monitor;
        if !monitor.is_null() {
            delete_monitor(monitor);
            (*header).monitor = ptr::null_mut();
        }

        // Leave the memory inert until the collector reclaims it.
        ptr::copy_nonoverlapping(class.init.as_ptr(), p, class.init.len());
        drop(guard);
    }

    /// Finalize and release an instance deterministically.
    ///
    /// A class-supplied deallocator replaces the collector free;
    /// reference-counted instances return to the C heap.
    ///
    /// # Safety
    ///
    /// Same contract as [`Runtime::finalize`]; additionally `p` must not
    /// be reachable afterwards.
    pub unsafe fn delete_instance(&self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        let vtable = (*(p as *const ObjectHeader)).vtable;
        let class = if vtable.is_null() {
            None
        } else {
            Some(&*(*vtable).class)
        };

        self.finalize(p, true);

        match class {
            Some(c) => {
                if let Some(dealloc) = c.dealloc {
                    dealloc(p);
                } else if c.flags.contains(ClassFlags::REF_COUNTED) {
                    libc::free(p as *mut libc::c_void);
                } else {
                    self.gc.free(p);
                }
            }
            None => self.gc.free(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_gc::SimHeap;
    use parking_lot::Mutex;

    static EVENTS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn drain_events() -> Vec<&'static str> {
        std::mem::take(&mut *EVENTS.lock())
    }

    fn log(event: &'static str) {
        EVENTS.lock().push(event);
    }

    /// Build a leaked class the way a compiler would emit one: an
    /// initializer image of `size` bytes whose header words point at the
    /// class's vtable.
    fn make_class(
        name: &'static str,
        base: Option<&'static ClassInfo>,
        flags: ClassFlags,
        dtor: Option<Destructor>,
        dealloc: Option<unsafe fn(*mut u8)>,
        size: usize,
    ) -> &'static ClassInfo {
        assert!(size >= std::mem::size_of::<ObjectHeader>());
        let vtable: &'static mut VTable = Box::leak(Box::new(VTable { class: ptr::null() }));
        let vtable_addr = vtable as *const VTable as usize;

        let mut image = vec![0u8; size];
        image[..std::mem::size_of::<usize>()].copy_from_slice(&vtable_addr.to_ne_bytes());
        let image: &'static [u8] = Box::leak(image.into_boxed_slice());

        let class: &'static ClassInfo = Box::leak(Box::new(ClassInfo {
            name,
            init: image,
            flags,
            base,
            dtor,
            dealloc,
        }));
        vtable.class = class;
        class
    }

    fn make_chain() -> &'static ClassInfo {
        unsafe fn dtor_a(_p: *mut u8) {
            log("~A");
        }
        unsafe fn dtor_b(_p: *mut u8) {
            log("~B");
        }
        unsafe fn dtor_c(_p: *mut u8) {
            log("~C");
        }

        let a = make_class("A", None, ClassFlags::empty(), Some(dtor_a), None, 32);
        let b = make_class("B", Some(a), ClassFlags::empty(), Some(dtor_b), None, 32);
        make_class("C", Some(b), ClassFlags::empty(), Some(dtor_c), None, 32)
    }

    /// Tests share the global event log and hooks; serialize them.
    static CLASS_TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_finalize_runs_chain_derived_to_base() {
        let _serial = CLASS_TEST_LOCK.lock();
        let heap = SimHeap::new();
        let rt = Runtime::new(&heap);
        let class = make_chain();

        unsafe fn monitor_logger(_m: *mut u8) {
            log("monitor");
        }
        set_monitor_delete(monitor_logger);
        set_collect_handler(None);
        drain_events();

        let obj = rt.alloc_instance(class);
        unsafe {
            (*(obj as *mut ObjectHeader)).monitor = 0x1000 as *mut u8;
            rt.finalize(obj, false);
        }

        // Scenario: chain order C, B, A; monitor deletion after the
        // chain; vtable slot zero on exit.
        assert_eq!(drain_events(), vec!["~C", "~B", "~A", "monitor"]);
        let header = obj as *const ObjectHeader;
        unsafe {
            assert!((*header).vtable.is_null());
            assert!((*header).monitor.is_null());
        }
    }

    #[test]
    fn test_finalize_without_vtable_is_noop() {
        let _serial = CLASS_TEST_LOCK.lock();
        let heap = SimHeap::new();
        let rt = Runtime::new(&heap);
        let class = make_chain();
        drain_events();

        let obj = rt.alloc_instance(class);
        unsafe {
            (*(obj as *mut ObjectHeader)).vtable = ptr::null();
            rt.finalize(obj, false);
        }
        assert!(drain_events().is_empty());
    }

    #[test]
    fn test_collect_handler_vetoes_chain_but_not_cleanup() {
        let _serial = CLASS_TEST_LOCK.lock();
        let heap = SimHeap::new();
        let rt = Runtime::new(&heap);
        let class = make_chain();

        fn veto(_obj: *mut u8) -> bool {
            false
        }
        set_collect_handler(Some(veto));
        drain_events();

        let obj = rt.alloc_instance(class);
        unsafe { rt.finalize(obj, false) };
        assert!(drain_events().is_empty(), "handler must veto the chain");
        unsafe { assert!((*(obj as *const ObjectHeader)).vtable.is_null()) };

        // Deterministic destruction ignores the handler.
        let obj = rt.alloc_instance(class);
        unsafe { rt.finalize(obj, true) };
        assert_eq!(drain_events(), vec!["~C", "~B", "~A"]);

        set_collect_handler(None);
    }

    #[test]
    fn test_collect_handler_cell_last_writer_wins() {
        let _serial = CLASS_TEST_LOCK.lock();
        fn yes(_: *mut u8) -> bool {
            true
        }
        fn no(_: *mut u8) -> bool {
            false
        }

        assert!(collect_handler().is_none());
        set_collect_handler(Some(yes));
        assert_eq!(collect_handler(), Some(yes as CollectHandler));
        set_collect_handler(Some(no));
        assert_eq!(collect_handler(), Some(no as CollectHandler));
        set_collect_handler(None);
        assert!(collect_handler().is_none());
    }

    #[test]
    fn test_panicking_destructor_is_isolated() {
        let _serial = CLASS_TEST_LOCK.lock();
        let heap = SimHeap::new();
        let rt = Runtime::new(&heap);

        unsafe fn exploding(_p: *mut u8) {
            panic!("destructor failure");
        }
        let class = make_class(
            "Exploding",
            None,
            ClassFlags::empty(),
            Some(exploding),
            None,
            24,
        );

        fn sink(name: &str, _payload: &(dyn std::any::Any + Send)) {
            assert_eq!(name, "Exploding");
            log("reported");
        }
        hooks::set_finalize_error_handler(sink);
        set_collect_handler(None);
        drain_events();

        let obj = rt.alloc_instance(class);
        unsafe { rt.finalize(obj, false) };

        // The failure is reported and the vtable still cleared.
        assert_eq!(drain_events(), vec!["reported"]);
        unsafe { assert!((*(obj as *const ObjectHeader)).vtable.is_null()) };
    }

    #[test]
    fn test_ref_counted_allocation_and_delete() {
        let _serial = CLASS_TEST_LOCK.lock();
        let heap = SimHeap::new();
        let rt = Runtime::new(&heap);

        let class = make_class(
            "Handle",
            None,
            ClassFlags::REF_COUNTED | ClassFlags::NO_POINTERS,
            None,
            None,
            24,
        );

        let obj = rt.alloc_instance(class);
        // Not a collector block.
        assert!(rt.gc().query(obj).is_null());
        assert_eq!(heap.live_blocks(), 0);
        unsafe { rt.delete_instance(obj) };
    }

    #[test]
    fn test_gc_instance_flags_and_delete() {
        let _serial = CLASS_TEST_LOCK.lock();
        let heap = SimHeap::new();
        let rt = Runtime::new(&heap);
        let class = make_chain();
        set_collect_handler(None);
        drain_events();

        let obj = rt.alloc_instance(class);
        let info = rt.gc().query(obj);
        assert!(info.attr.contains(BlkAttr::FINALIZE));
        assert!(!info.attr.contains(BlkAttr::NO_SCAN));

        unsafe { rt.delete_instance(obj) };
        assert_eq!(drain_events(), vec!["~C", "~B", "~A"]);
        assert_eq!(heap.live_blocks(), 0);
    }

    #[test]
    fn test_custom_deallocator_skips_gc_free() {
        let _serial = CLASS_TEST_LOCK.lock();
        let heap = SimHeap::new();
        let rt = Runtime::new(&heap);

        unsafe fn custom_free(_p: *mut u8) {
            log("dealloc");
        }
        let class = make_class(
            "Pooled",
            None,
            ClassFlags::empty(),
            None,
            Some(custom_free),
            24,
        );

        set_collect_handler(None);
        drain_events();
        let obj = rt.alloc_instance(class);
        assert_eq!(heap.live_blocks(), 1);
        unsafe { rt.delete_instance(obj) };

        assert_eq!(drain_events(), vec!["dealloc"]);
        // The collector block was intentionally not freed here.
        assert_eq!(heap.live_blocks(), 1);
    }
}
