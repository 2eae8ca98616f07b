//! In-memory task queue.
//!
//! [`TaskQueue`] wraps a [`PriorityQueue`] and is the only way work gets
//! scheduled: callers `put`, the [`Worker`](crate::worker::Worker) `get`s.
//! It also owns the lifecycle signal every state change is published on.

pub mod priority;
pub mod unique;

pub use priority::PriorityQueue;
pub use unique::UniqueTaskQueue;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::debug;

use crate::event::{Event, EventKind};
use crate::model::{NewTask, Task, TaskHandle};
use crate::signal::Signal;
use crate::telemetry::metrics;

/// Name of the lifecycle signal owned by each queue.
pub const LIFECYCLE_SIGNAL: &str = "task_lifecycle";

/// Priority task queue safe for many producers and one consumer.
pub struct TaskQueue {
    tasks: PriorityQueue,
    events: Arc<Signal<Event>>,
    event_seq: AtomicU64,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            tasks: PriorityQueue::new(),
            events: Arc::new(Signal::new(LIFECYCLE_SIGNAL)),
            event_seq: AtomicU64::new(0),
        }
    }

    /// Create a pending task and queue it.
    pub fn put(&self, new: NewTask) -> TaskHandle {
        let task = new.into_task();
        let handle = task.handle();
        self.put_task(task);
        handle
    }

    /// Queue an existing pending task, e.g. one coming back for a repeat.
    pub(crate) fn put_task(&self, task: Task) {
        debug!(
            task_id = %task.id(),
            job_id = %task.job_id(),
            priority = %task.priority(),
            status = %task.status(),
            "put task"
        );

        let kind = EventKind::TaskQueued {
            id: task.id(),
            job_id: task.job_id().clone(),
            priority: task.priority(),
            run_after: task.run_after(),
        };
        metrics::tasks_enqueued().add(1, &[KeyValue::new("priority", task.priority().to_string())]);

        // TaskQueued must precede the TaskStarted of the same task
        self.emit(kind);
        self.tasks.push(task);
    }

    /// Non-blocking. The most urgent task whose `run_after` has passed.
    pub fn get(&self) -> Option<Task> {
        self.get_at(Utc::now())
    }

    /// Like [`TaskQueue::get`], with an explicit notion of "now".
    pub fn get_at(&self, now: DateTime<Utc>) -> Option<Task> {
        let task = self.tasks.pop_ready(now)?;
        debug!(task_id = %task.id(), job_id = %task.job_id(), "get task");
        Some(task)
    }

    /// Tasks queued and not yet handed to the worker, delayed ones included.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// When the earliest delayed task becomes eligible.
    pub fn next_run_after(&self) -> Option<DateTime<Utc>> {
        self.tasks.next_run_after()
    }

    /// Lifecycle events for every task that passes through this queue.
    pub fn events(&self) -> &Arc<Signal<Event>> {
        &self.events
    }

    /// Sent with no lock held so subscribers may call back into the queue.
    /// Concurrent emitters may therefore deliver out of `seq` order.
    pub(crate) fn emit(&self, kind: EventKind) {
        let event = Event {
            seq: self.event_seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            kind,
        };
        self.events.send(&event);
    }
}
