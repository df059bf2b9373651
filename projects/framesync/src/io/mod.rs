//! Boundary contracts for transports.
//!
//! Concrete transports (RTSP frame readers, MQTT subscribers/publishers)
//! live outside this crate; they plug in by implementing [`SourceChannel`]
//! and [`OutputSink`]. The in-memory adapters in [`memory`] satisfy the
//! same contracts for tests and the demo binary.

mod memory;

pub use memory::{CollectSink, MemorySource, NullSink};

use crate::error::{ConnectionError, SendError};
use crate::pipeline::types::{Item, ResultEnvelope, SourceId};

/// One input adapter producing a sequence of tagged items.
///
/// `receive` may block on network I/O. Returning `Ok(None)` signals a clean
/// end of stream, which is what drives `run_until_complete` drains.
pub trait SourceChannel: Send {
    fn id(&self) -> SourceId;

    /// One-time connection setup. Failure is fatal to pipeline startup.
    fn initialize(&mut self) -> Result<(), ConnectionError>;

    fn receive(&mut self) -> Result<Option<Item>, ConnectionError>;
}

/// Destination for inference results.
///
/// `send` is expected to be non-blocking-bounded; any internal buffering or
/// drop policy is the sink's own concern. The pipeline reports failures and
/// moves on, it never retries.
pub trait OutputSink: Send + Sync {
    /// One-time connection setup. Failure is fatal to pipeline startup.
    fn initialize(&self) -> Result<(), ConnectionError>;

    fn send(&self, result: ResultEnvelope) -> Result<(), SendError>;
}
