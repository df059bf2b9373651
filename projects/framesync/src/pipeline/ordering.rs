//! Ordering Stage: restores monotonic sequence order for one
//! out-of-order source before synchronization.
//!
//! The window is bounded. A persistent gap never blocks forever: when the
//! buffer fills, the expectation is advanced past the gap and the stream
//! continues with bounded staleness instead of stalling.

use crate::pipeline::types::Item;
use std::collections::BTreeMap;

/// Counters exposed by one reorder window.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrderingStats {
    /// Items released downstream, in order.
    pub released: u64,
    /// Items older than the current expectation, discarded.
    pub stale_drops: u64,
    /// Items whose sequence number was already buffered, discarded.
    pub duplicate_drops: u64,
    /// Times the buffer filled and the expectation was forced forward.
    pub forced_advances: u64,
}

/// Bounded reorder window over one source's `sequence_number`s.
pub struct ReorderBuffer {
    next_expected: u64,
    buffered: BTreeMap<u64, Item>,
    capacity: usize,
    stats: OrderingStats,
}

impl ReorderBuffer {
    pub fn new(capacity: usize) -> Self {
        Self::starting_at(capacity, 0)
    }

    /// Window whose first expected sequence number is `first_seq`, for
    /// transports that do not count from zero.
    pub fn starting_at(capacity: usize, first_seq: u64) -> Self {
        assert!(capacity > 0, "reorder window capacity must be at least 1");
        Self {
            next_expected: first_seq,
            buffered: BTreeMap::new(),
            capacity,
            stats: OrderingStats::default(),
        }
    }

    /// Ingests one item and returns every item that is now releasable,
    /// in strictly increasing sequence order.
    pub fn push(&mut self, item: Item) -> Vec<Item> {
        let seq = item.sequence_number;
        let mut released = Vec::new();

        if seq < self.next_expected {
            self.stats.stale_drops += 1;
            tracing::debug!(
                source = %item.source_id,
                sequence = seq,
                expected = self.next_expected,
                "dropping stale item"
            );
            return released;
        }

        if seq == self.next_expected {
            self.next_expected = seq + 1;
            released.push(item);
            self.drain_contiguous(&mut released);
            return released;
        }

        // seq > next_expected: hold it until the gap fills.
        if self.buffered.contains_key(&seq) {
            self.stats.duplicate_drops += 1;
            return released;
        }

        if self.buffered.len() >= self.capacity {
            // Window full. Release the smallest buffered entry (it is still
            // valid data, only the gap before it is lost) and move the
            // expectation past it. A newcomer that now sits behind the
            // forced release is stale; inserting it would break the
            // increasing-order contract.
            self.stats.forced_advances += 1;
            if let Some((&smallest, _)) = self.buffered.iter().next() {
                let evicted = self.buffered.remove(&smallest).unwrap();
                tracing::warn!(
                    source = %evicted.source_id,
                    gap_start = self.next_expected,
                    gap_end = smallest,
                    "reorder window full, advancing past gap"
                );
                self.next_expected = evicted.sequence_number + 1;
                released.push(evicted);
            }
            if seq < self.next_expected {
                self.stats.stale_drops += 1;
            } else if seq == self.next_expected {
                self.next_expected = seq + 1;
                released.push(item);
            } else {
                self.buffered.insert(seq, item);
            }
            self.drain_contiguous(&mut released);
            return released;
        }

        self.buffered.insert(seq, item);
        released
    }

    fn drain_contiguous(&mut self, released: &mut Vec<Item>) {
        while let Some(item) = self.buffered.remove(&self.next_expected) {
            self.next_expected += 1;
            released.push(item);
        }
    }

    /// Releases everything still held back, in ascending order. Called at
    /// end of stream, when no more arrivals can fill the gaps.
    pub fn flush(&mut self) -> Vec<Item> {
        let drained: Vec<Item> = std::mem::take(&mut self.buffered).into_values().collect();
        if let Some(last) = drained.last() {
            self.next_expected = last.sequence_number + 1;
        }
        drained
    }

    pub fn stats(&self) -> OrderingStats {
        self.stats
    }

    /// Number of items currently held back.
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::SourceId;
    use std::sync::Arc;

    fn item(seq: u64) -> Item {
        Item::new(SourceId::new("mqtt"), seq, seq, Arc::new(vec![]))
    }

    fn push_all(buffer: &mut ReorderBuffer, seqs: &[u64]) -> Vec<u64> {
        seqs.iter()
            .flat_map(|&s| buffer.push(item(s)))
            .map(|it| it.sequence_number)
            .collect()
    }

    #[test]
    fn test_in_order_passthrough() {
        let mut buffer = ReorderBuffer::new(10);
        assert_eq!(push_all(&mut buffer, &[0, 1, 2, 3]), vec![0, 1, 2, 3]);
        assert_eq!(buffer.buffered_len(), 0);
    }

    #[test]
    fn test_scrambled_window_restores_order() {
        // [3,1,2,5,4] with threshold 10; this stream counts from 1.
        let mut buffer = ReorderBuffer::starting_at(10, 1);
        assert_eq!(push_all(&mut buffer, &[3, 1, 2, 5, 4]), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_all_permutations_release_sorted() {
        // Every permutation of 0..5 within the window must come out sorted.
        let perms: &[&[u64]] = &[
            &[0, 1, 2, 3, 4],
            &[4, 3, 2, 1, 0],
            &[2, 0, 4, 1, 3],
            &[1, 0, 3, 2, 4],
            &[4, 0, 1, 2, 3],
        ];
        for perm in perms {
            let mut buffer = ReorderBuffer::new(10);
            let out = push_all(&mut buffer, perm);
            assert_eq!(out, vec![0, 1, 2, 3, 4], "input {perm:?}");
        }
    }

    #[test]
    fn test_duplicate_in_window_dropped() {
        let mut buffer = ReorderBuffer::new(10);
        let out = push_all(&mut buffer, &[1, 1, 0]);
        assert_eq!(out, vec![0, 1]);
        assert_eq!(buffer.stats().duplicate_drops, 1);
    }

    #[test]
    fn test_stale_item_dropped() {
        let mut buffer = ReorderBuffer::new(10);
        push_all(&mut buffer, &[0, 1, 2]);
        assert!(buffer.push(item(1)).is_empty());
        assert_eq!(buffer.stats().stale_drops, 1);
    }

    #[test]
    fn test_full_buffer_forces_progress() {
        // Capacity 3, sequence 0 never arrives. Items 1..=3 fill the
        // window; item 4 forces the expectation past the gap.
        let mut buffer = ReorderBuffer::new(3);
        assert!(push_all(&mut buffer, &[1, 2, 3]).is_empty());
        assert_eq!(buffer.buffered_len(), 3);

        let out = push_all(&mut buffer, &[4]);
        assert_eq!(out, vec![1, 2, 3, 4]);
        assert_eq!(buffer.stats().forced_advances, 1);
        assert_eq!(buffer.next_expected(), 5);
    }

    #[test]
    fn test_forced_advance_drops_newcomer_behind_release() {
        // Window of 1 holding seq 5; seq 3 arrives. The forced release of 5
        // moves the expectation to 6, so 3 is now behind it and must be
        // dropped, never released after 5.
        let mut buffer = ReorderBuffer::new(1);
        assert!(buffer.push(item(5)).is_empty());
        assert_eq!(push_all(&mut buffer, &[3]), vec![5]);
        assert_eq!(buffer.stats().stale_drops, 1);
        assert_eq!(buffer.stats().forced_advances, 1);
        assert_eq!(buffer.next_expected(), 6);
    }

    #[test]
    fn test_forced_advance_keeps_output_monotonic() {
        let mut buffer = ReorderBuffer::new(2);
        let mut out = Vec::new();
        for &seq in &[5, 3, 9, 2, 7, 10, 11] {
            out.extend(buffer.push(item(seq)).into_iter().map(|i| i.sequence_number));
        }
        for pair in out.windows(2) {
            assert!(pair[0] < pair[1], "output not increasing: {out:?}");
        }
    }
}
