//! Generation-tagged update queue between scanner threads and the consumer.
//!
//! Producers call `post` from any thread; the single consumer calls `drain`
//! from its periodic tick. Records tagged with a superseded generation are
//! dropped on the way in and again on the way out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::events::PendingUpdate;

/// Queue depths at which posters start backing off.
const BACKPRESSURE_YIELD: usize = 20_000;
const BACKPRESSURE_SHORT: usize = 100_000;
const BACKPRESSURE_LONG: usize = 250_000;

/// Records moved out from under the lock per batch.
const DRAIN_BATCH: usize = 256;

/// How much work one `drain` call may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainBudget {
    pub time: Duration,
    pub max_records: usize,
}

impl DrainBudget {
    pub const SCANNING: DrainBudget = DrainBudget {
        time: Duration::from_millis(2),
        max_records: 1024,
    };
    pub const IDLE: DrainBudget = DrainBudget {
        time: Duration::from_millis(4),
        max_records: 4096,
    };

    pub fn for_activity(scan_active: bool) -> Self {
        if scan_active {
            Self::SCANNING
        } else {
            Self::IDLE
        }
    }
}

#[derive(Debug, Default)]
pub struct UpdateQueue {
    pending: Mutex<VecDeque<PendingUpdate>>,
    depth: AtomicUsize,
    generation: AtomicU64,
    dropped_stale: AtomicU64,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Start a new generation and discard everything still queued.
    pub fn begin_generation(&self) -> u64 {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let stale = pending.len();
        pending.clear();
        self.depth.store(0, Ordering::Release);
        self.dropped_stale.fetch_add(stale as u64, Ordering::Relaxed);
        generation
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_stale(&self) -> u64 {
        self.dropped_stale.load(Ordering::Relaxed)
    }

    /// Append a record. Returns false when the record belongs to a
    /// superseded generation and was discarded.
    ///
    /// May sleep briefly when the consumer has fallen far behind.
    pub fn post(&self, update: PendingUpdate) -> bool {
        if update.generation != self.generation() {
            self.dropped_stale.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.apply_backpressure();

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        // The generation may have moved while we slept.
        if update.generation != self.generation() {
            self.dropped_stale.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        pending.push_back(update);
        self.depth.store(pending.len(), Ordering::Release);
        true
    }

    fn apply_backpressure(&self) {
        let depth = self.len();
        if depth > BACKPRESSURE_LONG {
            std::thread::sleep(Duration::from_millis(5));
        } else if depth > BACKPRESSURE_SHORT {
            std::thread::sleep(Duration::from_millis(1));
        } else if depth > BACKPRESSURE_YIELD {
            std::thread::yield_now();
        }
    }

    /// Pop records from the front in order and hand each current-generation
    /// record to `apply`, stopping when either budget is exhausted. Never
    /// blocks on producers. Returns the number of records consumed.
    pub fn drain<F>(&self, budget: DrainBudget, mut apply: F) -> usize
    where
        F: FnMut(PendingUpdate),
    {
        let started = Instant::now();
        let mut processed = 0;
        let mut batch: VecDeque<PendingUpdate> = VecDeque::with_capacity(DRAIN_BATCH);

        while processed < budget.max_records && started.elapsed() < budget.time {
            if batch.is_empty() {
                let take = DRAIN_BATCH.min(budget.max_records - processed);
                let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
                let take = take.min(pending.len());
                batch.extend(pending.drain(..take));
                self.depth.store(pending.len(), Ordering::Release);
            }
            let Some(update) = batch.pop_front() else {
                break;
            };
            processed += 1;
            if update.generation != self.generation() {
                self.dropped_stale.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            apply(update);
        }

        if !batch.is_empty() {
            // Budget ran out mid-batch: put the rest back in front, in order.
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let current = self.generation();
            while let Some(update) = batch.pop_back() {
                if update.generation == current {
                    pending.push_front(update);
                }
            }
            self.depth.store(pending.len(), Ordering::Release);
        }

        processed
    }
}
