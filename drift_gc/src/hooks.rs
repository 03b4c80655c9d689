//! Host-runtime error sinks.
//!
//! The runtime never recovers from resource exhaustion or finalizer
//! failure locally; both are routed to process-wide hooks the host
//! installs at startup. Hooks are nullable function-pointer cells: null
//! at process start, last writer wins.

use std::any::Any;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Handler invoked on allocation failure or arithmetic overflow. Must not
/// return.
pub type OomHandler = fn() -> !;

/// Sink for a destructor failure during finalization. Receives the class
/// name and the panic payload.
pub type FinalizeErrorHandler = fn(class_name: &str, payload: &(dyn Any + Send));

static OOM_HANDLER: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static FINALIZE_ERROR_HANDLER: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Install the out-of-memory handler.
pub fn set_oom_handler(handler: OomHandler) {
    OOM_HANDLER.store(handler as *mut (), Ordering::Release);
}

/// Install the finalize-error sink.
pub fn set_finalize_error_handler(handler: FinalizeErrorHandler) {
    FINALIZE_ERROR_HANDLER.store(handler as *mut (), Ordering::Release);
}

/// Report memory exhaustion. Does not return.
///
/// Dispatches to the installed handler; without one, panics. Called on
/// any allocation failure and on detected size-arithmetic overflow.
pub fn out_of_memory() -> ! {
    let raw = OOM_HANDLER.load(Ordering::Acquire);
    if !raw.is_null() {
        // Safety: only ever stored from an `OomHandler` in `set_oom_handler`.
        let handler: OomHandler = unsafe { mem::transmute(raw) };
        handler();
    }
    panic!("drift: out of memory");
}

/// Report a destructor failure during finalization.
///
/// Dispatches to the installed sink; without one, writes a note to
/// stderr. Finalization continues after the report.
pub fn finalize_error(class_name: &str, payload: &(dyn Any + Send)) {
    let raw = FINALIZE_ERROR_HANDLER.load(Ordering::Acquire);
    if !raw.is_null() {
        // Safety: only ever stored from a `FinalizeErrorHandler`.
        let handler: FinalizeErrorHandler = unsafe { mem::transmute(raw) };
        handler(class_name, payload);
    } else {
        eprintln!("drift: destructor of {class_name} failed during finalization");
    }
}
