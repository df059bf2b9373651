//! Synchronizer: correlates items from N channels into aligned tuples.
//!
//! A pending group exists from the first member item until every configured
//! source has filled its slot (the group is emitted exactly once) or the
//! group is evicted by the capacity bound or the age timeout. Evicted
//! partials are dropped, never padded with stale data.

use crate::pipeline::types::{Item, SourceId, SynchronizedTuple};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

struct PendingGroup {
    slots: HashMap<SourceId, Item>,
    created_at: Instant,
}

/// Counters exposed by the synchronizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncStats {
    pub tuples_emitted: u64,
    /// Groups dropped because the pending map exceeded its capacity.
    pub capacity_evictions: u64,
    /// Groups dropped because they outlived the group timeout.
    pub timeout_evictions: u64,
    /// Items that overwrote an already-filled slot for their key.
    pub slot_overwrites: u64,
}

pub struct Synchronizer {
    /// Fixed source order; tuples lay their items out in this order.
    expected_sources: Vec<SourceId>,
    pending: HashMap<u64, PendingGroup>,
    /// Keys in insertion order. Entries may be stale (completed or already
    /// evicted); they are skipped lazily, keeping eviction O(1) amortized.
    insertion_order: VecDeque<u64>,
    capacity: usize,
    group_timeout: Duration,
    stats: SyncStats,
}

impl Synchronizer {
    pub fn new(expected_sources: Vec<SourceId>, capacity: usize, group_timeout: Duration) -> Self {
        assert!(!expected_sources.is_empty(), "at least one source required");
        assert!(capacity > 0, "pending capacity must be at least 1");
        Self {
            expected_sources,
            pending: HashMap::new(),
            insertion_order: VecDeque::new(),
            capacity,
            group_timeout,
            stats: SyncStats::default(),
        }
    }

    /// Ingests one item. Returns a tuple when the item completes its group.
    pub fn ingest(&mut self, item: Item) -> Option<SynchronizedTuple> {
        let key = item.correlation_key;

        let group = self.pending.entry(key).or_insert_with(|| {
            self.insertion_order.push_back(key);
            PendingGroup {
                slots: HashMap::new(),
                created_at: Instant::now(),
            }
        });

        if group.slots.insert(item.source_id.clone(), item).is_some() {
            self.stats.slot_overwrites += 1;
        }

        let complete = self
            .expected_sources
            .iter()
            .all(|id| self.pending[&key].slots.contains_key(id));

        let emitted = if complete {
            let group = self.pending.remove(&key).unwrap();
            Some(self.build_tuple(key, group))
        } else {
            None
        };

        self.evict_over_capacity();
        emitted
    }

    /// Evicts every group older than the configured timeout. Call
    /// periodically; eviction bounds the latency a stalled source can add.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, g)| now.duration_since(g.created_at) >= self.group_timeout)
            .map(|(&k, _)| k)
            .collect();

        for key in &expired {
            if let Some(group) = self.pending.remove(key) {
                self.stats.timeout_evictions += 1;
                tracing::debug!(
                    correlation_key = key,
                    filled = group.slots.len(),
                    expected = self.expected_sources.len(),
                    "pending group timed out"
                );
            }
        }
        expired.len()
    }

    fn evict_over_capacity(&mut self) {
        while self.pending.len() > self.capacity {
            let Some(oldest) = self.insertion_order.pop_front() else {
                break;
            };
            // Stale queue entry: the key already completed or was swept.
            if let Some(group) = self.pending.remove(&oldest) {
                self.stats.capacity_evictions += 1;
                tracing::debug!(
                    correlation_key = oldest,
                    filled = group.slots.len(),
                    expected = self.expected_sources.len(),
                    "pending group evicted at capacity"
                );
            }
        }
    }

    fn build_tuple(&mut self, key: u64, mut group: PendingGroup) -> SynchronizedTuple {
        self.stats.tuples_emitted += 1;
        let items = self
            .expected_sources
            .iter()
            .map(|id| group.slots.remove(id).unwrap())
            .collect();
        SynchronizedTuple {
            correlation_key: key,
            items,
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Number of pending (incomplete) groups.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether a group is currently pending for `key`.
    pub fn is_pending(&self, key: u64) -> bool {
        self.pending.contains_key(&key)
    }
}
