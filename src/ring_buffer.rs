//! Ring Buffer (C7): bounded in-memory FIFO of recent records.
//!
//! Capacity is always `2 × batch_size`. Dropping the oldest item on
//! overflow is safe because the item was already durably appended to the
//! outbox before `push` is called.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::metrics::PipelineMetrics;

pub struct RingBuffer<T> {
    cap: usize,
    items: Mutex<VecDeque<T>>,
    metrics: Arc<PipelineMetrics>,
}

impl<T> RingBuffer<T> {
    pub fn new(cap: usize, metrics: Arc<PipelineMetrics>) -> Self {
        Self { cap, items: Mutex::new(VecDeque::with_capacity(cap)), metrics }
    }

    /// Push an item, dropping the oldest if at capacity. O(1).
    pub fn push(&self, item: T) {
        let mut items = self.items.lock();
        if items.len() >= self.cap {
            items.pop_front();
        }
        items.push_back(item);
        self.metrics.ring_depth.set(items.len() as i64);
    }

    /// Remove and return up to `n` oldest items.
    pub fn drip(&self, n: usize) -> Vec<T> {
        let mut items = self.items.lock();
        let take = n.min(items.len());
        let drained: Vec<T> = items.drain(0..take).collect();
        self.metrics.ring_depth.set(items.len() as i64);
        drained
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// For any capacity and any sequence of pushes interleaved with
        /// drips, `len()` never exceeds `cap` (invariant: ring cap).
        #[test]
        fn len_never_exceeds_cap(
            cap in 1usize..20,
            ops in prop::collection::vec((any::<bool>(), 0usize..8), 0..100),
        ) {
            let ring: RingBuffer<u32> = RingBuffer::new(cap, PipelineMetrics::new());
            let mut next = 0u32;
            for (is_push, drip_n) in ops {
                if is_push {
                    ring.push(next);
                    next += 1;
                } else {
                    ring.drip(drip_n);
                }
                prop_assert!(ring.len() <= cap);
            }
        }
    }
}
