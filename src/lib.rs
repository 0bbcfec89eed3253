//! Trace every call to `malloc()`, `calloc()`, `realloc()` and `free()` made
//! by a program, catch illegal and double frees, and report statistics and
//! leaked blocks when the program exits.
//!
//! Built with the `preload` feature, the cdylib exports the four functions
//! and is meant to be injected with `LD_PRELOAD`. Without it, the
//! [`Tracer`](alloc::tracer::Tracer) can be driven directly over any
//! [`RealAllocator`](alloc::real::RealAllocator).

pub mod alloc;
pub mod config;
#[cfg(feature = "preload")]
mod externc;
pub mod report;
pub mod serialize;
pub mod session;
pub mod util;

pub use alloc::{
    ledger::{AllocRecord, Ledger},
    real::{NextAllocator, RealAllocator, ResolveError},
    stats::{Counters, Statistics},
    tracer::Tracer,
};
pub use config::{Config, ConfigError};
pub use session::{SessionError, SessionState};
