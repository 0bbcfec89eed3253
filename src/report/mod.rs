pub mod sink;
pub mod summary;

pub use sink::{Event, EventSink, LogSink, NullSink, RecordingSink, TextSink};
pub use summary::{Report, ReportError};
