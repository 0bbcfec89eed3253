//! The allocator we are tracing. In the preloaded library this is whatever
//! `malloc()` & co. come after us in the symbol search order, looked up once
//! with `dlsym(RTLD_NEXT, ...)`.

use std::ffi::{c_char, CStr};

use libc::{c_void, size_t};
use thiserror::Error;

pub type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;

/// The four entry points of the allocation family. Semantics (zero sizes, null
/// pointers, overflow) are whatever the implementation says they are; the
/// tracer never reinterprets them.
pub trait RealAllocator {
    fn malloc(&self, size: usize) -> *mut c_void;

    fn calloc(&self, count: usize, size: usize) -> *mut c_void;

    /// # Safety
    ///
    /// Same contract as C `realloc()`: `ptr` is null or a live allocation of
    /// this allocator.
    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void;

    /// # Safety
    ///
    /// Same contract as C `free()`: `ptr` is null or a live allocation of this
    /// allocator.
    unsafe fn free(&self, ptr: *mut c_void);
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("could not resolve `{}`: {reason}", .symbol.to_string_lossy())]
    MissingSymbol {
        symbol: &'static CStr,
        reason: String,
    },
}

/// Look up the next definition of `name` after the object this code lives in.
///
/// # Safety
///
/// Calls `dlsym()`/`dlerror()`, which may allocate through whatever `calloc()`
/// is currently bound. The caller has to be able to serve that.
pub unsafe fn lookup_next(name: &'static CStr) -> Result<*mut c_void, ResolveError> {
    // clear any stale error first
    libc::dlerror();
    let symbol = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
    let error: *const c_char = libc::dlerror();
    if !error.is_null() {
        return Err(ResolveError::MissingSymbol {
            symbol: name,
            reason: CStr::from_ptr(error).to_string_lossy().into_owned(),
        });
    }
    if symbol.is_null() {
        return Err(ResolveError::MissingSymbol {
            symbol: name,
            reason: "symbol is null".to_owned(),
        });
    }
    Ok(symbol)
}

/// The allocator that comes next in the symbol search order (normally libc's)
#[derive(Clone, Copy, Debug)]
pub struct NextAllocator {
    malloc: MallocFn,
    free: FreeFn,
    calloc: CallocFn,
    realloc: ReallocFn,
}

impl NextAllocator {
    /// Resolve `malloc`, `free`, `calloc` and `realloc`, in that order.
    pub fn resolve() -> Result<Self, ResolveError> {
        // SAFETY: every symbol is transmuted to the signature documented for it
        // in the C standard
        unsafe {
            Ok(Self {
                malloc: std::mem::transmute::<*mut c_void, MallocFn>(lookup_next(c"malloc")?),
                free: std::mem::transmute::<*mut c_void, FreeFn>(lookup_next(c"free")?),
                calloc: std::mem::transmute::<*mut c_void, CallocFn>(lookup_next(c"calloc")?),
                realloc: std::mem::transmute::<*mut c_void, ReallocFn>(lookup_next(c"realloc")?),
            })
        }
    }
}

impl RealAllocator for NextAllocator {
    fn malloc(&self, size: usize) -> *mut c_void {
        // SAFETY: `malloc()` accepts any size
        unsafe { (self.malloc)(size) }
    }

    fn calloc(&self, count: usize, size: usize) -> *mut c_void {
        // SAFETY: `calloc()` checks `count * size` for overflow itself
        unsafe { (self.calloc)(count, size) }
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        (self.realloc)(ptr, size)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        (self.free)(ptr)
    }
}

impl<A: RealAllocator + ?Sized> RealAllocator for &A {
    fn malloc(&self, size: usize) -> *mut c_void {
        (**self).malloc(size)
    }

    fn calloc(&self, count: usize, size: usize) -> *mut c_void {
        (**self).calloc(count, size)
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        (**self).realloc(ptr, size)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        (**self).free(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_the_libc_allocator() {
        let real = NextAllocator::resolve().unwrap();
        let p = real.malloc(32);
        assert!(!p.is_null());
        let p = unsafe { real.realloc(p, 64) };
        assert!(!p.is_null());
        unsafe { real.free(p) };

        let z = real.calloc(4, 8) as *mut u8;
        assert!(!z.is_null());
        let bytes = unsafe { std::slice::from_raw_parts(z, 32) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { real.free(z as _) };
    }

    #[test]
    fn missing_symbol_is_an_error() {
        let err = unsafe { lookup_next(c"memtrace_there_is_no_such_symbol") }.unwrap_err();
        let ResolveError::MissingSymbol { symbol, .. } = &err;
        assert_eq!(*symbol, c"memtrace_there_is_no_such_symbol");
        assert!(err
            .to_string()
            .starts_with("could not resolve `memtrace_there_is_no_such_symbol`"));
    }
}
