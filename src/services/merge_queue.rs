//! Time-ordering merge queue.
//!
//! Several producers (exchange fetch workers, replay tasks) push batches;
//! a consumer pops the earliest buffered element. All access goes through
//! one mutex: the queue is not the bottleneck of the pipeline. Consumers
//! that run dry await [`MergeQueue::wait_for_push`] instead of polling.

use crate::types::Timestamped;
use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::warn;

/// Heap entry. `seq` keeps equal timestamps in insertion order.
struct Entry<T> {
    timestamp: DateTime<Utc>,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.seq.cmp(&other.seq))
    }
}

struct Inner<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    next_seq: u64,
}

/// Thread-safe min-heap keyed by timestamp.
pub struct MergeQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: Option<usize>,
    pushed: Notify,
    closed: AtomicBool,
}

impl<T: Timestamped> MergeQueue<T> {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            capacity: None,
            pushed: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a queue that drops items beyond `capacity`.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Push a batch. Returns how many items were accepted.
    pub fn push<I>(&self, batch: I) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        let mut batch = batch.into_iter().peekable();
        if batch.peek().is_none() {
            return 0;
        }

        let mut inner = self.lock();
        let mut accepted = 0;
        let mut dropped = 0;

        for item in batch {
            if let Some(cap) = self.capacity {
                if inner.heap.len() >= cap {
                    dropped += 1;
                    continue;
                }
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Reverse(Entry {
                timestamp: item.timestamp(),
                seq,
                item,
            }));
            accepted += 1;
        }

        drop(inner);

        if dropped > 0 {
            warn!("Merge queue full, dropped {} items", dropped);
        }
        if accepted > 0 {
            self.pushed.notify_one();
        }

        accepted
    }

    /// Mark producers finished. Buffered items can still be popped.
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
        self.pushed.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    /// True once producers are finished and nothing is buffered.
    pub fn is_drained(&self) -> bool {
        self.is_closed() && self.is_empty()
    }

    /// Resolve after the next accepted push or [`MergeQueue::close`].
    ///
    /// A wakeup that happened while nobody was waiting is kept, so checking
    /// the queue and then awaiting does not miss a push in between.
    pub async fn wait_for_push(&self) {
        self.pushed.notified().await;
    }

    /// Remove and return the earliest element. Never blocks.
    pub fn pop_earliest(&self) -> Option<T> {
        self.lock().heap.pop().map(|Reverse(entry)| entry.item)
    }

    /// Timestamp of the earliest element without removing it.
    pub fn peek_timestamp(&self) -> Option<DateTime<Utc>> {
        self.lock().heap.peek().map(|Reverse(entry)| entry.timestamp)
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        // heap push/pop leave the heap valid even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Timestamped> Default for MergeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
