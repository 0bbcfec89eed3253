//! The interception layer: the same four entry points as the real allocator,
//! each one forwarding to it while keeping the [`Ledger`] and the counters up
//! to date and telling the sink what happened.
//!
//! Ledger, counters and sink sit behind a single lock, so events reach the
//! sink in the same order as the ledger sees them, whichever thread made the
//! call. `realloc()` holds the lock across the real call: once the real
//! allocator has moved a block, its old address may be handed to another
//! thread, and that thread's record must not be confused with ours.

use std::{
    ptr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use libc::c_void;
use log::debug;

use crate::{
    alloc::{
        ledger::Ledger,
        real::RealAllocator,
        stats::{Counters, Statistics},
    },
    report::{sink::EventSink, summary::Report},
};

struct TracerState<S> {
    ledger: Ledger,
    counters: Counters,
    sink: S,
}

pub struct Tracer<A, S>
where
    A: RealAllocator,
    S: EventSink,
{
    real: A,
    state: Mutex<TracerState<S>>,
}

impl<A, S> Tracer<A, S>
where
    A: RealAllocator,
    S: EventSink,
{
    /// A tracer with an empty ledger. Nothing is emitted until
    /// [`start()`](Self::start).
    pub fn new(real: A, sink: S) -> Self {
        Self {
            real,
            state: Mutex::new(TracerState {
                ledger: Ledger::new(),
                counters: Counters::default(),
                sink,
            }),
        }
    }

    /// The allocator must keep working even if a sink panicked while we held
    /// the lock, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, TracerState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn real(&self) -> &A {
        &self.real
    }

    /// Emit the session-start marker
    pub fn start(&self) {
        self.lock().sink.session_start();
    }

    pub fn malloc(&self, size: usize) -> *mut c_void {
        let ptr = self.real.malloc(size);

        let mut state = self.lock();
        let TracerState {
            ledger,
            counters,
            sink,
        } = &mut *state;
        let tracked = ledger.insert(ptr as usize, size).is_some();
        counters.record_malloc(size, tracked);
        sink.malloc(size, ptr as usize);
        ptr
    }

    /// Accounts for `count * size` bytes (saturating), which is what the block
    /// actually holds.
    pub fn calloc(&self, count: usize, size: usize) -> *mut c_void {
        let ptr = self.real.calloc(count, size);
        let bytes = count.saturating_mul(size);

        let mut state = self.lock();
        let TracerState {
            ledger,
            counters,
            sink,
        } = &mut *state;
        let tracked = ledger.insert(ptr as usize, bytes).is_some();
        counters.record_calloc(bytes, tracked);
        sink.calloc(count, size, ptr as usize);
        ptr
    }

    /// # Safety
    ///
    /// Same contract as C `realloc()`, with two exceptions:
    ///
    /// - a `ptr` whose newest record is already released is reported as a
    ///   double free, not forwarded, and null is returned
    /// - a `ptr` the ledger has never seen is still forwarded, since it may
    ///   predate tracing; its old size is taken to be 0 and it is counted in
    ///   [`Counters::untracked_reallocs`]
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        let address = ptr as usize;

        let mut state = self.lock();
        let TracerState {
            ledger,
            counters,
            sink,
        } = &mut *state;

        let prior = ledger.find(address).copied();
        if prior.is_some_and(|record| !record.is_live()) {
            ledger.release(address);
            counters.double_frees += 1;
            counters.record_realloc(size, false);
            sink.realloc(address, size, 0);
            sink.double_free();
            return ptr::null_mut();
        }

        let new_ptr = self.real.realloc(ptr, size);
        // a failed resize leaves the old block where it was
        let failed = new_ptr.is_null() && size != 0;

        match prior {
            // a resize hands nothing back, unless it shrinks the block to nothing
            Some(record) if !failed => {
                if size == 0 {
                    counters.record_freed(record.size);
                }
                ledger.release(address);
            }
            Some(_) => {}
            None if !ptr.is_null() => {
                debug!("realloc() of untracked pointer {address:#x}");
                counters.untracked_reallocs += 1;
            }
            None => {}
        }

        let tracked = ledger.insert(new_ptr as usize, size).is_some();
        counters.record_realloc(size, tracked);
        sink.realloc(address, size, new_ptr as usize);
        new_ptr
    }

    /// Only forwarded to the real `free()` if `ptr` is a live allocation we
    /// know about. Illegal and double frees are reported and swallowed.
    ///
    /// # Safety
    ///
    /// Same contract as C `free()`, except that passing a pointer that is not
    /// a live allocation is caught rather than undefined.
    pub unsafe fn free(&self, ptr: *mut c_void) {
        let address = ptr as usize;

        let forward = {
            let mut state = self.lock();
            let TracerState {
                ledger,
                counters,
                sink,
            } = &mut *state;

            counters.free_calls += 1;
            sink.free(address);
            if ptr.is_null() {
                return;
            }

            match ledger.release(address) {
                None => {
                    counters.illegal_frees += 1;
                    sink.illegal_free();
                    false
                }
                Some(record) if record.is_double_released() => {
                    counters.double_frees += 1;
                    sink.double_free();
                    false
                }
                Some(record) => {
                    counters.record_freed(record.size);
                    true
                }
            }
        };

        if forward {
            self.real.free(ptr);
        }
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    pub fn statistics(&self) -> Statistics {
        self.lock().counters.statistics()
    }

    /// A snapshot of what [`shutdown()`](Self::shutdown) would report now
    pub fn report(&self) -> Report {
        let state = self.lock();
        Report::new(&state.counters, &state.ledger)
    }

    pub fn with_ledger<R>(&self, f: impl FnOnce(&Ledger) -> R) -> R {
        f(&self.lock().ledger)
    }

    pub fn with_sink<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.lock().sink)
    }

    /// Report statistics and leaks, emit the session-stop marker and drop the
    /// ledger. Calls made afterwards are still forwarded and tracked in a
    /// fresh ledger; the session makes sure there are none.
    pub fn shutdown(&self) -> Report {
        let mut state = self.lock();
        let TracerState {
            ledger,
            counters,
            sink,
        } = &mut *state;

        let report = Report::new(counters, ledger);
        sink.statistics(&report.statistics);

        let mut leaks = ledger.live().peekable();
        if leaks.peek().is_some() {
            sink.leaks_start();
        }
        for record in leaks {
            sink.leak(record);
        }

        sink.session_stop();
        ledger.teardown();
        debug!(
            "tracer shut down: {} leaked block(s), {} byte(s)",
            report.leaks.len(),
            report.leaked_bytes()
        );
        report
    }

    pub fn into_sink(self) -> S {
        self.state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .sink
    }
}
