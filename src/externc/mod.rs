//! The C entry points that shadow libc's when the library is preloaded, plus
//! the constructor/destructor pair that brackets the session.

use std::ptr;

use libc::{c_void, size_t};

use crate::{
    alloc::{bootstrap::BOOTSTRAP, real::RealAllocator},
    session::{self, Route},
    util::hint::cold,
};

#[no_mangle]
pub extern "C" fn malloc(size: size_t) -> *mut c_void {
    match session::route() {
        Route::Trace(tracer, _guard) => tracer.malloc(size),
        Route::Real(real) => real.malloc(size),
        Route::Bootstrap => cold(|| BOOTSTRAP.allocate(size)),
    }
}

#[no_mangle]
pub extern "C" fn calloc(count: size_t, size: size_t) -> *mut c_void {
    match session::route() {
        Route::Trace(tracer, _guard) => tracer.calloc(count, size),
        Route::Real(real) => real.calloc(count, size),
        Route::Bootstrap => cold(|| BOOTSTRAP.allocate_zeroed(count, size)),
    }
}

/// # Safety
///
/// Same contract as C `realloc()`
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    if BOOTSTRAP.contains(ptr) {
        return cold(|| bootstrap_realloc(ptr, size));
    }
    match session::route() {
        Route::Trace(tracer, _guard) => tracer.realloc(ptr, size),
        Route::Real(real) => real.realloc(ptr, size),
        // only bootstrap blocks exist before the real allocator does
        Route::Bootstrap => cold(|| BOOTSTRAP.allocate(size)),
    }
}

/// # Safety
///
/// Same contract as C `free()`
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    // bootstrap blocks are never given back
    if BOOTSTRAP.contains(ptr) {
        return;
    }
    match session::route() {
        Route::Trace(tracer, _guard) => tracer.free(ptr),
        Route::Real(real) => real.free(ptr),
        Route::Bootstrap => {}
    }
}

/// Move a bootstrap block into a block from [`malloc()`]. The old one stays
/// where it is.
unsafe fn bootstrap_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let new_ptr = malloc(size);
    if !new_ptr.is_null() {
        let len = BOOTSTRAP.size_of(ptr).min(size);
        ptr::copy_nonoverlapping(ptr as *const u8, new_ptr as *mut u8, len);
    }
    new_ptr
}

extern "C" fn memtrace_init() {
    // the first allocation may already have started the session
    let _ = session::start();
}

extern "C" fn memtrace_fini() {
    let _ = session::stop();
}

#[used]
#[link_section = ".init_array"]
static INIT: extern "C" fn() = memtrace_init;

#[used]
#[link_section = ".fini_array"]
static FINI: extern "C" fn() = memtrace_fini;
