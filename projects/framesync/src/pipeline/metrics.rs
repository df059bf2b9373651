//! Observability surface: shared counters plus a pull-based snapshot.
//!
//! Components own their hot-path state; they only bump these atomics at
//! drop/error sites. The supervisor assembles a [`MetricsSnapshot`] on
//! demand, so nothing here sits on the pipeline's hot path.

use crate::pipeline::types::WorkerState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared between pipeline components and the supervisor.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Stale or duplicate items discarded by ordering stages.
    pub ordering_drops: AtomicU64,
    /// Times an ordering stage forced its expectation past a gap.
    pub ordering_forced_advances: AtomicU64,
    /// Pending groups evicted by capacity or timeout.
    pub sync_drops: AtomicU64,
    /// Items that overwrote an already-filled slot for their key.
    pub slot_overwrites: AtomicU64,
    /// Tuples emitted by the synchronizer.
    pub tuples_emitted: AtomicU64,
    /// Tuples dropped at a full dispatch queue (DropNewest policy only).
    pub dispatch_drops: AtomicU64,
    /// Per-item inference failures absorbed by worker slots.
    pub inference_errors: AtomicU64,
    /// Sink send failures (reported, not retried).
    pub send_errors: AtomicU64,
    /// Results delivered to the Output Sink.
    pub results_sent: AtomicU64,
}

impl PipelineMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Point-in-time view of the whole pipeline, safe to serialize and log.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Current depth of each source channel's bounded buffer.
    pub source_depths: BTreeMap<String, usize>,
    /// Current depth of the dispatch queue.
    pub dispatch_depth: usize,
    /// Current size of the pending-group map.
    pub pending_groups: usize,
    pub worker_states: Vec<WorkerState>,
    pub ordering_drops: u64,
    pub ordering_forced_advances: u64,
    pub sync_drops: u64,
    pub slot_overwrites: u64,
    pub tuples_emitted: u64,
    pub dispatch_drops: u64,
    pub inference_errors: u64,
    pub send_errors: u64,
    pub results_sent: u64,
}

impl MetricsSnapshot {
    pub(crate) fn collect(
        metrics: &PipelineMetrics,
        source_depths: BTreeMap<String, usize>,
        dispatch_depth: usize,
        pending_groups: usize,
        worker_states: Vec<WorkerState>,
    ) -> Self {
        Self {
            taken_at: Utc::now(),
            source_depths,
            dispatch_depth,
            pending_groups,
            worker_states,
            ordering_drops: metrics.ordering_drops.load(Ordering::Relaxed),
            ordering_forced_advances: metrics.ordering_forced_advances.load(Ordering::Relaxed),
            sync_drops: metrics.sync_drops.load(Ordering::Relaxed),
            slot_overwrites: metrics.slot_overwrites.load(Ordering::Relaxed),
            tuples_emitted: metrics.tuples_emitted.load(Ordering::Relaxed),
            dispatch_drops: metrics.dispatch_drops.load(Ordering::Relaxed),
            inference_errors: metrics.inference_errors.load(Ordering::Relaxed),
            send_errors: metrics.send_errors.load(Ordering::Relaxed),
            results_sent: metrics.results_sent.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes() {
        let metrics = PipelineMetrics::default();
        PipelineMetrics::incr(&metrics.tuples_emitted);
        PipelineMetrics::incr(&metrics.slot_overwrites);
        PipelineMetrics::add(&metrics.results_sent, 3);

        let snapshot = MetricsSnapshot::collect(
            &metrics,
            BTreeMap::from([("rtsp".to_string(), 2)]),
            1,
            4,
            vec![WorkerState::Ready, WorkerState::Busy],
        );
        assert_eq!(snapshot.tuples_emitted, 1);
        assert_eq!(snapshot.results_sent, 3);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["pending_groups"], 4);
        assert_eq!(json["slot_overwrites"], 1);
        assert_eq!(json["source_depths"]["rtsp"], 2);
    }
}
