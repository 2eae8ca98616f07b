//! Thread-safe priority container for tasks.
//!
//! Two partitions share one lock:
//!
//! - *ready*: a max-heap on `(priority, Reverse(seq))`, so the most urgent
//!   task comes out first and equal priorities come out in enqueue order;
//! - *delayed*: a min-heap on `(run_after, seq)` holding tasks whose
//!   `run_after` has not passed yet.
//!
//! Every [`PriorityQueue::pop_ready`] first promotes delayed entries that have
//! become eligible, keeping their original sequence number, then pops the
//! ready heap. Delayed tasks stay where they are until promoted; nothing is
//! dropped and nothing blocks.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::model::{Priority, Task};

struct ReadyEntry {
    priority: Priority,
    seq: u64,
    task: Task,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then lower sequence number
        (self.priority, Reverse(self.seq)).cmp(&(other.priority, Reverse(other.seq)))
    }
}

struct DelayedEntry {
    run_after: DateTime<Utc>,
    seq: u64,
    task: Task,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest run_after on top
        (other.run_after, other.seq).cmp(&(self.run_after, self.seq))
    }
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
}

impl Inner {
    fn promote(&mut self, now: DateTime<Utc>) {
        while self.delayed.peek().is_some_and(|e| e.run_after <= now) {
            if let Some(entry) = self.delayed.pop() {
                self.ready.push(ReadyEntry {
                    priority: entry.task.priority(),
                    seq: entry.seq,
                    task: entry.task,
                });
            }
        }
    }
}

/// Priority + FIFO ordered storage for [`Task`]s.
#[derive(Default)]
pub struct PriorityQueue {
    inner: Mutex<Inner>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task. Returns its enqueue sequence number.
    pub fn push(&self, task: Task) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        match task.run_after() {
            Some(run_after) => inner.delayed.push(DelayedEntry {
                run_after,
                seq,
                task,
            }),
            None => inner.ready.push(ReadyEntry {
                priority: task.priority(),
                seq,
                task,
            }),
        }
        seq
    }

    /// Remove and return the most urgent task eligible at `now`.
    pub fn pop_ready(&self, now: DateTime<Utc>) -> Option<Task> {
        let mut inner = self.inner.lock();
        inner.promote(now);
        inner.ready.pop().map(|entry| entry.task)
    }

    /// Earliest `run_after` among tasks that are not yet eligible.
    pub fn next_run_after(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().delayed.peek().map(|e| e.run_after)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.ready.len() + inner.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
