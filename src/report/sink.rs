//! Where tracer events end up. The tracer only ever talks to an [`EventSink`]
//! through this fixed set of calls, one per event kind; how an event is
//! rendered is entirely up to the sink.

use std::io::{self, Write};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::alloc::{ledger::AllocRecord, stats::Statistics};

pub trait EventSink {
    fn session_start(&mut self);
    fn session_stop(&mut self);

    fn malloc(&mut self, size: usize, address: usize);
    fn calloc(&mut self, count: usize, size: usize, address: usize);
    fn realloc(&mut self, old_address: usize, size: usize, new_address: usize);
    /// Emitted for every `free()`, before any diagnostic about it
    fn free(&mut self, address: usize);

    /// The preceding `free()` was of an address we have never seen
    fn illegal_free(&mut self);
    /// The preceding `free()` was of an address that is already released
    fn double_free(&mut self);

    fn statistics(&mut self, statistics: &Statistics);
    /// Emitted once, right before the first [`leak()`](EventSink::leak)
    fn leaks_start(&mut self);
    fn leak(&mut self, record: &AllocRecord);
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn session_start(&mut self) {
        (**self).session_start()
    }

    fn session_stop(&mut self) {
        (**self).session_stop()
    }

    fn malloc(&mut self, size: usize, address: usize) {
        (**self).malloc(size, address)
    }

    fn calloc(&mut self, count: usize, size: usize, address: usize) {
        (**self).calloc(count, size, address)
    }

    fn realloc(&mut self, old_address: usize, size: usize, new_address: usize) {
        (**self).realloc(old_address, size, new_address)
    }

    fn free(&mut self, address: usize) {
        (**self).free(address)
    }

    fn illegal_free(&mut self) {
        (**self).illegal_free()
    }

    fn double_free(&mut self) {
        (**self).double_free()
    }

    fn statistics(&mut self, statistics: &Statistics) {
        (**self).statistics(statistics)
    }

    fn leaks_start(&mut self) {
        (**self).leaks_start()
    }

    fn leak(&mut self, record: &AllocRecord) {
        (**self).leak(record)
    }
}

/// One line per event, e.g.
///
/// ```plaintext
/// memtrace: malloc(64) = 0x55d0c0a012a0
/// memtrace: free(0x55d0c0a012a0)
/// memtrace:     *** DOUBLE FREE *** (ignoring)
/// ```
///
/// Write errors are counted and otherwise ignored: there is nobody to report
/// them to.
pub struct TextSink<W: Write> {
    out: W,
    write_errors: u64,
}

impl TextSink<io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl<W: Write> TextSink<W> {
    pub const fn new(out: W) -> Self {
        Self {
            out,
            write_errors: 0,
        }
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, args: std::fmt::Arguments<'_>) {
        if writeln!(self.out, "memtrace: {args}").is_err() {
            self.write_errors += 1;
        }
    }
}

impl<W: Write> EventSink for TextSink<W> {
    fn session_start(&mut self) {
        self.line(format_args!("session started"));
    }

    fn session_stop(&mut self) {
        self.line(format_args!("session stopped"));
        if self.out.flush().is_err() {
            self.write_errors += 1;
        }
    }

    fn malloc(&mut self, size: usize, address: usize) {
        self.line(format_args!("malloc({size}) = {address:#x}"));
    }

    fn calloc(&mut self, count: usize, size: usize, address: usize) {
        self.line(format_args!("calloc({count}, {size}) = {address:#x}"));
    }

    fn realloc(&mut self, old_address: usize, size: usize, new_address: usize) {
        self.line(format_args!(
            "realloc({old_address:#x}, {size}) = {new_address:#x}"
        ));
    }

    fn free(&mut self, address: usize) {
        self.line(format_args!("free({address:#x})"));
    }

    fn illegal_free(&mut self) {
        self.line(format_args!("    *** ILLEGAL FREE *** (ignoring)"));
    }

    fn double_free(&mut self) {
        self.line(format_args!("    *** DOUBLE FREE *** (ignoring)"));
    }

    fn statistics(&mut self, statistics: &Statistics) {
        self.line(format_args!("statistics"));
        self.line(format_args!(
            "  allocated_total      {}",
            statistics.total_bytes
        ));
        self.line(format_args!(
            "  allocated_avg        {}",
            statistics.average_block_size
        ));
        self.line(format_args!(
            "  freed_total          {}",
            statistics.freed_bytes
        ));
    }

    fn leaks_start(&mut self) {
        self.line(format_args!("non-deallocated memory blocks"));
        self.line(format_args!(
            "  {:<18} {:>10} {:>7}",
            "block", "size", "ref cnt"
        ));
    }

    fn leak(&mut self, record: &AllocRecord) {
        self.line(format_args!(
            "  {:<#18x} {:>10} {:>7}",
            record.address, record.size, record.live_count
        ));
    }
}

/// Forwards every event to the `log` facade under the `memtrace` target.
/// Diagnostics and leaks are warnings, everything else is info.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn session_start(&mut self) {
        info!(target: "memtrace", "session started");
    }

    fn session_stop(&mut self) {
        info!(target: "memtrace", "session stopped");
    }

    fn malloc(&mut self, size: usize, address: usize) {
        info!(target: "memtrace", "malloc({size}) = {address:#x}");
    }

    fn calloc(&mut self, count: usize, size: usize, address: usize) {
        info!(target: "memtrace", "calloc({count}, {size}) = {address:#x}");
    }

    fn realloc(&mut self, old_address: usize, size: usize, new_address: usize) {
        info!(target: "memtrace", "realloc({old_address:#x}, {size}) = {new_address:#x}");
    }

    fn free(&mut self, address: usize) {
        info!(target: "memtrace", "free({address:#x})");
    }

    fn illegal_free(&mut self) {
        warn!(target: "memtrace", "illegal free, not forwarded");
    }

    fn double_free(&mut self) {
        warn!(target: "memtrace", "double free, not forwarded");
    }

    fn statistics(&mut self, statistics: &Statistics) {
        info!(
            target: "memtrace",
            "allocated_total={} allocated_avg={} freed_total={}",
            statistics.total_bytes,
            statistics.average_block_size,
            statistics.freed_bytes
        );
    }

    fn leaks_start(&mut self) {
        warn!(target: "memtrace", "non-deallocated memory blocks:");
    }

    fn leak(&mut self, record: &AllocRecord) {
        warn!(
            target: "memtrace",
            "leak: {:#x} size={} ref_cnt={}",
            record.address,
            record.size,
            record.live_count
        );
    }
}

/// Drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn session_start(&mut self) {}
    fn session_stop(&mut self) {}
    fn malloc(&mut self, _: usize, _: usize) {}
    fn calloc(&mut self, _: usize, _: usize, _: usize) {}
    fn realloc(&mut self, _: usize, _: usize, _: usize) {}
    fn free(&mut self, _: usize) {}
    fn illegal_free(&mut self) {}
    fn double_free(&mut self) {}
    fn statistics(&mut self, _: &Statistics) {}
    fn leaks_start(&mut self) {}
    fn leak(&mut self, _: &AllocRecord) {}
}

/// A single sink call, as captured by [`RecordingSink`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    SessionStart,
    SessionStop,
    Malloc {
        size: usize,
        address: usize,
    },
    Calloc {
        count: usize,
        size: usize,
        address: usize,
    },
    Realloc {
        old_address: usize,
        size: usize,
        new_address: usize,
    },
    Free {
        address: usize,
    },
    IllegalFree,
    DoubleFree,
    Statistics(Statistics),
    LeaksStart,
    Leak(AllocRecord),
}

/// Keeps every event in memory, in order
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Vec<Event>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// How many recorded events match `pred`?
    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }

    pub fn leaks(&self) -> impl Iterator<Item = &AllocRecord> + '_ {
        self.events.iter().filter_map(|e| match e {
            Event::Leak(record) => Some(record),
            _ => None,
        })
    }
}

impl EventSink for RecordingSink {
    fn session_start(&mut self) {
        self.events.push(Event::SessionStart);
    }

    fn session_stop(&mut self) {
        self.events.push(Event::SessionStop);
    }

    fn malloc(&mut self, size: usize, address: usize) {
        self.events.push(Event::Malloc { size, address });
    }

    fn calloc(&mut self, count: usize, size: usize, address: usize) {
        self.events.push(Event::Calloc {
            count,
            size,
            address,
        });
    }

    fn realloc(&mut self, old_address: usize, size: usize, new_address: usize) {
        self.events.push(Event::Realloc {
            old_address,
            size,
            new_address,
        });
    }

    fn free(&mut self, address: usize) {
        self.events.push(Event::Free { address });
    }

    fn illegal_free(&mut self) {
        self.events.push(Event::IllegalFree);
    }

    fn double_free(&mut self) {
        self.events.push(Event::DoubleFree);
    }

    fn statistics(&mut self, statistics: &Statistics) {
        self.events.push(Event::Statistics(*statistics));
    }

    fn leaks_start(&mut self) {
        self.events.push(Event::LeaksStart);
    }

    fn leak(&mut self, record: &AllocRecord) {
        self.events.push(Event::Leak(*record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(f: impl FnOnce(&mut TextSink<Vec<u8>>)) -> String {
        let mut sink = TextSink::new(Vec::new());
        f(&mut sink);
        assert_eq!(sink.write_errors(), 0);
        String::from_utf8(sink.into_inner()).unwrap()
    }

    #[test]
    fn text_sink_formats_calls() {
        let out = text(|s| {
            s.malloc(64, 0x1000);
            s.calloc(4, 16, 0x2000);
            s.realloc(0x1000, 128, 0x3000);
            s.free(0x3000);
            s.free(0x4000);
            s.illegal_free();
        });
        assert_eq!(
            out,
            "memtrace: malloc(64) = 0x1000\n\
             memtrace: calloc(4, 16) = 0x2000\n\
             memtrace: realloc(0x1000, 128) = 0x3000\n\
             memtrace: free(0x3000)\n\
             memtrace: free(0x4000)\n\
             memtrace:     *** ILLEGAL FREE *** (ignoring)\n"
        );
    }

    #[test]
    fn text_sink_formats_report() {
        let out = text(|s| {
            s.statistics(&Statistics {
                total_bytes: 300,
                average_block_size: 100,
                freed_bytes: 200,
            });
            s.leaks_start();
            s.leak(&AllocRecord::new(0x1000, 64));
            s.session_stop();
        });
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], "memtrace: statistics");
        assert!(lines[1].ends_with(" 300"));
        assert!(lines[2].ends_with(" 100"));
        assert!(lines[3].ends_with(" 200"));
        assert_eq!(lines[4], "memtrace: non-deallocated memory blocks");
        assert!(lines[6].contains("0x1000"));
        assert!(lines[6].trim_end().ends_with("64       1"));
        assert_eq!(lines[7], "memtrace: session stopped");
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("broken"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn text_sink_counts_write_errors() {
        let mut sink = TextSink::new(Broken);
        sink.free(0x10);
        sink.double_free();
        assert_eq!(sink.write_errors(), 2);
    }

    #[test]
    fn recording_sink_keeps_order() {
        let mut sink: Box<dyn EventSink> = Box::new(RecordingSink::new());
        sink.session_start();
        sink.free(0x10);
        sink.double_free();
        drop(sink);

        let mut sink = RecordingSink::new();
        sink.free(0x10);
        sink.double_free();
        sink.leak(&AllocRecord::new(0x20, 2));
        assert_eq!(sink.count(|e| matches!(e, Event::DoubleFree)), 1);
        assert_eq!(sink.leaks().count(), 1);
        assert_eq!(
            sink.take(),
            [
                Event::Free { address: 0x10 },
                Event::DoubleFree,
                Event::Leak(AllocRecord::new(0x20, 2))
            ]
        );
        assert!(sink.events().is_empty());
    }
}
