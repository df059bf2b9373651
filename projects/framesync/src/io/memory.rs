//! In-memory transports for tests and the demo binary.

use crate::error::{ConnectionError, SendError};
use crate::io::{OutputSink, SourceChannel};
use crate::pipeline::types::{Item, ResultEnvelope, SourceId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source that replays a pre-seeded list of items, then reports end of
/// stream. An optional per-item delay simulates network pacing.
pub struct MemorySource {
    id: SourceId,
    items: VecDeque<Item>,
    delay: Option<Duration>,
    initialized: bool,
    /// When set, `initialize` fails with this reason.
    fail_connect: Option<String>,
}

impl MemorySource {
    pub fn new(id: SourceId, items: impl IntoIterator<Item = Item>) -> Self {
        Self {
            id,
            items: items.into_iter().collect(),
            delay: None,
            initialized: false,
            fail_connect: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes `initialize` fail, for startup-error tests.
    pub fn failing(id: SourceId, reason: impl Into<String>) -> Self {
        Self {
            id,
            items: VecDeque::new(),
            delay: None,
            initialized: false,
            fail_connect: Some(reason.into()),
        }
    }
}

impl SourceChannel for MemorySource {
    fn id(&self) -> SourceId {
        self.id.clone()
    }

    fn initialize(&mut self) -> Result<(), ConnectionError> {
        if let Some(reason) = &self.fail_connect {
            return Err(ConnectionError::new(self.id.as_str(), reason.clone()));
        }
        self.initialized = true;
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Item>, ConnectionError> {
        debug_assert!(self.initialized, "receive before initialize");
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(self.items.pop_front())
    }
}

/// Sink that accumulates every result for later assertions.
#[derive(Default)]
pub struct CollectSink {
    results: Mutex<Vec<ResultEnvelope>>,
}

impl CollectSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn results(&self) -> Vec<ResultEnvelope> {
        self.results.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutputSink for CollectSink {
    fn initialize(&self) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn send(&self, result: ResultEnvelope) -> Result<(), SendError> {
        self.results.lock().unwrap().push(result);
        Ok(())
    }
}

/// Sink that discards every result.
#[derive(Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn initialize(&self) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn send(&self, _result: ResultEnvelope) -> Result<(), SendError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_replays_then_ends() {
        let id = SourceId::new("mem");
        let items: Vec<Item> = (0..3)
            .map(|i| Item::new(id.clone(), i, i, Arc::new(vec![])))
            .collect();
        let mut source = MemorySource::new(id, items);
        source.initialize().unwrap();
        for expected in 0..3 {
            let item = source.receive().unwrap().unwrap();
            assert_eq!(item.correlation_key, expected);
        }
        assert!(source.receive().unwrap().is_none());
    }

    #[test]
    fn test_failing_source_reports_connection_error() {
        let mut source = MemorySource::failing(SourceId::new("mem"), "refused");
        let err = source.initialize().unwrap_err();
        assert!(err.to_string().contains("refused"));
    }
}
