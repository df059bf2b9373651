use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Identifier of one input channel, e.g. "rtsp" or "mqtt:bytetrack".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(Arc<str>);

impl SourceId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque payload bytes. The core never looks inside.
pub type Payload = Arc<Vec<u8>>;

/// One unit delivered by a Source Channel.
#[derive(Debug, Clone)]
pub struct Item {
    pub source_id: SourceId,
    /// Shared key used to align items across channels (frame index).
    pub correlation_key: u64,
    /// Per-source monotonically increasing counter.
    pub sequence_number: u64,
    pub arrival_time: Instant,
    pub payload: Payload,
}

impl Item {
    pub fn new(
        source_id: SourceId,
        correlation_key: u64,
        sequence_number: u64,
        payload: Payload,
    ) -> Self {
        Self {
            source_id,
            correlation_key,
            sequence_number,
            arrival_time: Instant::now(),
            payload,
        }
    }
}

/// One item per configured source, aligned on a correlation key.
/// Items are stored in the pipeline's fixed source order.
#[derive(Debug, Clone)]
pub struct SynchronizedTuple {
    pub correlation_key: u64,
    pub items: Vec<Item>,
}

impl SynchronizedTuple {
    /// Item for a given source, if present in this tuple.
    pub fn item_for(&self, source_id: &SourceId) -> Option<&Item> {
        self.items.iter().find(|it| &it.source_id == source_id)
    }
}

/// The unit delivered to the Output Sink.
#[derive(Debug, Clone)]
pub struct ResultEnvelope {
    pub correlation_key: u64,
    pub worker_id: usize,
    pub device: String,
    pub payload: Payload,
}

/// Lifecycle of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Initializing,
    Ready,
    Busy,
    Stopped,
}

/// Lock-free state cell shared between a worker thread and the supervisor.
#[derive(Debug)]
pub struct WorkerStateCell(AtomicU8);

impl WorkerStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(WorkerState::Initializing as u8))
    }

    pub fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> WorkerState {
        match self.0.load(Ordering::Relaxed) {
            0 => WorkerState::Initializing,
            1 => WorkerState::Ready,
            2 => WorkerState::Busy,
            _ => WorkerState::Stopped,
        }
    }
}

impl Default for WorkerStateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_state_cell_roundtrip() {
        let cell = WorkerStateCell::new();
        assert_eq!(cell.get(), WorkerState::Initializing);
        for state in [
            WorkerState::Ready,
            WorkerState::Busy,
            WorkerState::Stopped,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn test_tuple_item_lookup() {
        let video = SourceId::new("rtsp");
        let msg = SourceId::new("mqtt");
        let tuple = SynchronizedTuple {
            correlation_key: 7,
            items: vec![
                Item::new(video.clone(), 7, 7, Arc::new(vec![1])),
                Item::new(msg.clone(), 7, 7, Arc::new(vec![2])),
            ],
        };
        assert_eq!(*tuple.item_for(&msg).unwrap().payload, vec![2]);
        assert!(tuple.item_for(&SourceId::new("absent")).is_none());
    }
}
