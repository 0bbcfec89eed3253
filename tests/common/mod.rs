#![allow(dead_code)]

use std::{
    collections::HashMap,
    ptr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use libc::c_void;
use memtrace::{report::RecordingSink, RealAllocator, Tracer};

pub const HEAP_BASE: usize = 0x10_0000;
pub const BLOCK: usize = 0x100;

#[derive(Default)]
struct HeapState {
    next: usize,
    /// released addresses, handed out again last-in first-out
    reusable: Vec<usize>,
    live: HashMap<usize, usize>,
    forwarded_frees: Vec<usize>,
    forwarded_reallocs: Vec<usize>,
}

/// A pretend allocator that hands out addresses without backing memory. The
/// tracer never dereferences what it gets, so this is enough to drive it.
/// Released addresses are reused, which is what makes address reuse testable.
#[derive(Default)]
pub struct FakeHeap {
    state: Mutex<HeapState>,
    fail: AtomicBool,
}

impl FakeHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every allocating call return null until switched back
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub fn forwarded_frees(&self) -> Vec<usize> {
        self.state.lock().unwrap().forwarded_frees.clone()
    }

    /// Non-null pointers that reached `realloc()`
    pub fn forwarded_reallocs(&self) -> Vec<usize> {
        self.state.lock().unwrap().forwarded_reallocs.clone()
    }

    pub fn live_blocks(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    fn take(&self, size: usize) -> *mut c_void {
        if self.fail.load(Ordering::Relaxed) {
            return ptr::null_mut();
        }
        let mut state = self.state.lock().unwrap();
        let address = match state.reusable.pop() {
            Some(address) => address,
            None => {
                let address = HEAP_BASE + state.next * BLOCK;
                state.next += 1;
                address
            }
        };
        state.live.insert(address, size);
        address as *mut c_void
    }

    fn give_back(&self, ptr: *mut c_void) {
        let mut state = self.state.lock().unwrap();
        let address = ptr as usize;
        assert!(
            state.live.remove(&address).is_some(),
            "{address:#x} reached the real free() without being live"
        );
        state.reusable.push(address);
        state.forwarded_frees.push(address);
    }
}

impl RealAllocator for FakeHeap {
    fn malloc(&self, size: usize) -> *mut c_void {
        self.take(size)
    }

    fn calloc(&self, count: usize, size: usize) -> *mut c_void {
        match count.checked_mul(size) {
            Some(bytes) => self.take(bytes),
            None => ptr::null_mut(),
        }
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        if ptr.is_null() {
            return self.take(size);
        }
        self.state
            .lock()
            .unwrap()
            .forwarded_reallocs
            .push(ptr as usize);
        if size == 0 {
            self.give_back(ptr);
            return ptr::null_mut();
        }
        // always move, so old and new addresses differ
        let new_ptr = self.take(size);
        if !new_ptr.is_null() {
            self.give_back(ptr);
        }
        new_ptr
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        if !ptr.is_null() {
            self.give_back(ptr);
        }
    }
}

pub type TestTracer = Tracer<FakeHeap, RecordingSink>;

pub fn tracer() -> TestTracer {
    let _ = env_logger::builder().is_test(true).try_init();
    let tracer = Tracer::new(FakeHeap::new(), RecordingSink::new());
    tracer.start();
    tracer
}
