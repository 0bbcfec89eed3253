//! The one tracing session per process: resolving the real allocator, building
//! the tracer from the environment, and deciding where each intercepted call
//! goes while all of that is still in flight.

use std::{
    cell::Cell,
    fs::File,
    io::BufWriter,
    path::PathBuf,
    sync::atomic::{AtomicU8, Ordering},
};

use log::{debug, error, info};
use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::{
    alloc::{real::NextAllocator, tracer::Tracer},
    config::{Config, Output, SinkKind},
    report::{EventSink, LogSink, NullSink, Report, TextSink},
    util::print::write_stderr_line,
};

pub type DynSink = Box<dyn EventSink + Send>;

pub type SessionTracer = Tracer<NextAllocator, DynSink>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Nothing has happened yet. The first intercepted call starts the session.
    Uninitialized,
    /// Looking up the real allocator and reading the config. Calls made now
    /// are served without tracing.
    Resolving,
    /// Calls are traced
    Ready,
    /// Statistics and leaks have been reported. Calls are forwarded untraced.
    TornDown,
}

impl SessionState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Uninitialized,
            1 => SessionState::Resolving,
            2 => SessionState::Ready,
            _ => SessionState::TornDown,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("the session has already been started")]
    AlreadyStarted,
    #[error("the session is not running")]
    NotRunning,
}

struct Session {
    tracer: SessionTracer,
    report_path: Option<PathBuf>,
}

static STATE: AtomicU8 = AtomicU8::new(SessionState::Uninitialized as u8);
static REAL: OnceCell<NextAllocator> = OnceCell::new();
static SESSION: OnceCell<Session> = OnceCell::new();

thread_local! {
    static IN_TRACER: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as being inside the tracer until dropped.
/// Allocations made by the tracer itself (formatting, the ledger growing, the
/// logger) see the mark and are forwarded without being traced.
pub struct ReentryGuard(());

impl ReentryGuard {
    /// `None` if this thread is already inside the tracer, or if its
    /// thread-locals are gone (the thread is exiting).
    pub fn enter() -> Option<Self> {
        IN_TRACER
            .try_with(|inside| !inside.replace(true))
            .ok()
            .filter(|&entered| entered)
            .map(|_| ReentryGuard(()))
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let _ = IN_TRACER.try_with(|inside| inside.set(false));
    }
}

pub fn state() -> SessionState {
    SessionState::from_u8(STATE.load(Ordering::Acquire))
}

/// The real allocator, once it has been resolved
pub fn real() -> Option<&'static NextAllocator> {
    REAL.get()
}

/// The running tracer. Still returns the tracer after [`stop()`]; check
/// [`state()`] to know whether calls should go through it.
pub fn tracer() -> Option<&'static SessionTracer> {
    SESSION.get().map(|session| &session.tracer)
}

/// Where an intercepted call should go
pub enum Route {
    /// Through the tracer. The guard has to be held for the whole call.
    Trace(&'static SessionTracer, ReentryGuard),
    /// Straight to the real allocator
    Real(&'static NextAllocator),
    /// The real allocator is not known yet
    Bootstrap,
}

/// Decide where a call goes, starting the session if this is the first one.
pub fn route() -> Route {
    if let Some(guard) = ReentryGuard::enter() {
        if state() == SessionState::Uninitialized {
            // losing the race to another thread is fine
            let _ = start();
        }
        if state() == SessionState::Ready {
            if let Some(tracer) = tracer() {
                return Route::Trace(tracer, guard);
            }
        }
    }
    match real() {
        Some(real) => Route::Real(real),
        None => Route::Bootstrap,
    }
}

fn open_sink(config: &Config) -> DynSink {
    match config.sink {
        SinkKind::Off => Box::new(NullSink),
        SinkKind::Log => {
            if env_logger::Builder::new()
                .parse_filters(&config.log_filter)
                .try_init()
                .is_err()
            {
                debug!("a logger is already installed, using it");
            }
            Box::new(LogSink)
        }
        SinkKind::Text => match &config.output {
            Output::Stderr => Box::new(TextSink::stderr()),
            Output::File(path) => match File::create(path) {
                Ok(file) => Box::new(TextSink::new(BufWriter::new(file))),
                Err(err) => {
                    write_stderr_line(&[
                        b"memtrace: cannot open ",
                        path.to_string_lossy().as_bytes(),
                        b": ",
                        err.to_string().as_bytes(),
                        b", tracing to stderr",
                    ]);
                    Box::new(TextSink::stderr())
                }
            },
        },
    }
}

/// Resolve the real allocator, read the config and start tracing.
///
/// A real allocator that cannot be resolved is fatal: the process has nothing
/// to allocate with, so it exits with status 1 after saying why on stderr.
///
/// Runs inside a [`ReentryGuard`] (taken here unless the caller holds one).
/// Whatever it allocates is untracked, so it must also be freed untracked,
/// including the config dropped after `READY` is published.
pub fn start() -> Result<(), SessionError> {
    let _guard = ReentryGuard::enter();
    STATE
        .compare_exchange(
            SessionState::Uninitialized as u8,
            SessionState::Resolving as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map_err(|_| SessionError::AlreadyStarted)?;

    let real = match NextAllocator::resolve() {
        Ok(real) => real,
        Err(err) => {
            write_stderr_line(&[b"memtrace: ", err.to_string().as_bytes()]);
            std::process::exit(1)
        }
    };
    let real = *REAL.get_or_init(|| real);
    debug!(target: "memtrace", "resolved the real allocator: {real:?}");

    let config = Config::from_env().unwrap_or_else(|err| {
        write_stderr_line(&[b"memtrace: ", err.to_string().as_bytes(), b", using defaults"]);
        Config::default()
    });
    let sink = open_sink(&config);
    let tracer = Tracer::new(real, sink);
    tracer.start();

    // only the thread that left UNINITIALIZED gets here, so the cell is empty
    let _ = SESSION.set(Session {
        tracer,
        report_path: config.report_path.clone(),
    });
    STATE.store(SessionState::Ready as u8, Ordering::Release);
    info!(target: "memtrace", "session started ({:?} sink)", config.sink);
    Ok(())
}

/// Report statistics and leaks, write the JSON report if one was asked for,
/// and stop tracing. Later calls are forwarded untraced.
pub fn stop() -> Result<Report, SessionError> {
    let _guard = ReentryGuard::enter();
    STATE
        .compare_exchange(
            SessionState::Ready as u8,
            SessionState::TornDown as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map_err(|_| SessionError::NotRunning)?;
    let session = SESSION.get().ok_or(SessionError::NotRunning)?;

    let report = session.tracer.shutdown();
    if let Some(path) = &session.report_path {
        match report.write_to_file(path) {
            Ok(()) => info!(target: "memtrace", "report written to {}", path.display()),
            Err(err) => {
                error!(target: "memtrace", "{err}");
                write_stderr_line(&[
                    b"memtrace: cannot write report to ",
                    path.to_string_lossy().as_bytes(),
                    b": ",
                    err.to_string().as_bytes(),
                ]);
            }
        }
    }
    Ok(report)
}
