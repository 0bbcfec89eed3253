use std::{
    cell::UnsafeCell,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use libc::c_void;

use crate::util::num::round_up;

/// Every block starts on a 16-byte boundary, like glibc's `malloc()`
const ALIGN: usize = 16;

pub const BOOTSTRAP_CAPACITY: usize = 16 * 1024;

#[repr(C, align(16))]
struct Region<const N: usize>(UnsafeCell<[u8; N]>);

/// A simple stack allocator over a static buffer, for the few allocations that
/// happen while we are still looking up the real `malloc()` (`dlsym()` itself
/// likes to `calloc()`). Returns null once the buffer is used up.
///
/// `free()` of a bootstrap block is a nop and `allocate()` is just an sp bump.
/// Each block is preceded by a `usize` header holding its requested size, so
/// that a later `realloc()` knows how much to copy out.
///
/// ```plaintext
/// +--------+---------------+--------+-----------
/// | size   | data          | size   | data ...
/// +--------+---------------+--------+-----------
///  ALIGN    round_up(size)
/// ```
pub struct BootstrapArena<const N: usize = BOOTSTRAP_CAPACITY> {
    region: Region<N>,
    sp: AtomicUsize,
}

// SAFETY: blocks are carved out with an atomic bump, so no two callers ever get
// overlapping bytes
unsafe impl<const N: usize> Sync for BootstrapArena<N> {}

impl<const N: usize> BootstrapArena<N> {
    pub const fn new() -> Self {
        Self {
            region: Region(UnsafeCell::new([0; N])),
            sp: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> *mut u8 {
        self.region.0.get() as *mut u8
    }

    /// Bytes handed out so far, headers included
    pub fn used(&self) -> usize {
        self.sp.load(Ordering::Relaxed)
    }

    /// Carve out `size` bytes, or return null if they do not fit. Memory is
    /// never reused, so it is always zeroed.
    pub fn allocate(&self, size: usize) -> *mut c_void {
        if size > N {
            return ptr::null_mut();
        }
        // zero-sized blocks still get a byte, so that they sit inside the arena
        let needed = ALIGN + round_up(size.max(1), ALIGN);
        let mut sp = self.sp.load(Ordering::Relaxed);
        loop {
            let end = match sp.checked_add(needed) {
                Some(end) if end <= N => end,
                _ => return ptr::null_mut(),
            };
            match self
                .sp
                .compare_exchange_weak(sp, end, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => sp = current,
            }
        }
        // SAFETY: `sp + needed <= N`, and `[sp, sp + needed)` now belongs to us
        unsafe {
            let header = self.base().add(sp);
            (header as *mut usize).write(size);
            header.add(ALIGN) as *mut c_void
        }
    }

    /// `calloc()` flavour of [`allocate()`](Self::allocate)
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> *mut c_void {
        match count.checked_mul(size) {
            Some(bytes) => self.allocate(bytes),
            None => ptr::null_mut(),
        }
    }

    /// Does `ptr` point into this arena?
    pub fn contains(&self, ptr: *const c_void) -> bool {
        let start = self.base() as usize;
        let p = ptr as usize;
        p >= start && p < start + N
    }

    /// The requested size of a block returned by [`allocate()`](Self::allocate)
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate()` on this arena
    pub unsafe fn size_of(&self, ptr: *const c_void) -> usize {
        debug_assert!(self.contains(ptr));
        (ptr as *const u8).sub(ALIGN).cast::<usize>().read()
    }
}

impl<const N: usize> Default for BootstrapArena<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The arena used by the preloaded library
pub static BOOTSTRAP: BootstrapArena = BootstrapArena::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_aligned_and_disjoint() {
        let arena = BootstrapArena::<256>::new();
        let a = arena.allocate(1);
        let b = arena.allocate(17);
        let c = arena.allocate(0);
        for p in [a, b, c] {
            assert!(!p.is_null());
            assert_eq!(p as usize % ALIGN, 0);
            assert!(arena.contains(p));
        }
        assert_eq!(b as usize - a as usize, 2 * ALIGN);
        assert_eq!(c as usize - b as usize, 3 * ALIGN);
        assert_eq!(arena.used(), 7 * ALIGN);
    }

    #[test]
    fn remembers_sizes() {
        let arena = BootstrapArena::<256>::new();
        let a = arena.allocate(5);
        let b = arena.allocate_zeroed(3, 7);
        unsafe {
            assert_eq!(arena.size_of(a), 5);
            assert_eq!(arena.size_of(b), 21);
            let bytes = std::slice::from_raw_parts(b as *const u8, 21);
            assert!(bytes.iter().all(|&x| x == 0));
        }
    }

    #[test]
    fn exhaustion_returns_null() {
        let arena = BootstrapArena::<80>::new();
        assert!(!arena.allocate(32).is_null());
        assert!(arena.allocate(32).is_null());
        let last = arena.allocate(0);
        assert!(!last.is_null());
        assert!(arena.contains(last));
        assert!(arena.allocate(0).is_null());
        assert!(arena.allocate(usize::MAX).is_null());
        assert!(arena.allocate_zeroed(usize::MAX, 2).is_null());
    }

    #[test]
    fn foreign_pointers_are_not_contained() {
        let arena = BootstrapArena::<64>::new();
        let outside = Box::new(0u64);
        assert!(!arena.contains(&*outside as *const u64 as *const c_void));
        assert!(!arena.contains(ptr::null()));
    }
}
