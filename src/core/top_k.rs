//! Bounded "largest K" selection over a stream.
//!
//! A fixed-capacity min-heap keeps the K heaviest items seen so far; anything
//! lighter than the heap minimum, or evicted from it, is folded into a
//! running remainder. O(n log k) time, O(k) memory.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Heap slot ordered by weight, then by key (ties keep the smaller key).
#[derive(Debug)]
struct Slot<K, T> {
    weight: u64,
    key: K,
    item: T,
}

impl<K: Ord, T> PartialEq for Slot<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord, T> Eq for Slot<K, T> {}

impl<K: Ord, T> PartialOrd for Slot<K, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, T> Ord for Slot<K, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // A "larger" slot is heavier, or equally heavy with a smaller key.
        self.weight
            .cmp(&other.weight)
            .then_with(|| other.key.cmp(&self.key))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Folded {
    pub weight: u64,
    pub count: u64,
}

/// Keeps the `capacity` heaviest items. `K` breaks weight ties so the
/// outcome does not depend on arrival order.
#[derive(Debug)]
pub struct TopK<K, T> {
    capacity: usize,
    heap: BinaryHeap<Reverse<Slot<K, T>>>,
    folded: Folded,
}

impl<K: Ord, T> TopK<K, T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity.min(4096)),
            folded: Folded::default(),
        }
    }

    pub fn push(&mut self, weight: u64, key: K, item: T) {
        let slot = Slot { weight, key, item };
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(slot));
            return;
        }
        let beats_min = self
            .heap
            .peek()
            .is_some_and(|Reverse(min)| slot > *min);
        if beats_min {
            if let Some(Reverse(evicted)) = self.heap.pop() {
                self.fold(evicted.weight);
            }
            self.heap.push(Reverse(slot));
        } else {
            self.fold(slot.weight);
        }
    }

    fn fold(&mut self, weight: u64) {
        self.folded.weight += weight;
        self.folded.count += 1;
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn folded(&self) -> Folded {
        self.folded
    }

    /// Retained items, heaviest first (ties by key ascending), plus the
    /// folded remainder.
    pub fn into_sorted(self) -> (Vec<(u64, K, T)>, Folded) {
        let mut slots: Vec<Slot<K, T>> = self.heap.into_iter().map(|Reverse(s)| s).collect();
        slots.sort_by(|a, b| b.cmp(a));
        let retained = slots
            .into_iter()
            .map(|s| (s.weight, s.key, s.item))
            .collect();
        (retained, self.folded)
    }
}
