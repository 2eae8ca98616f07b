//! Deduplicating front of the task queue.
//!
//! At most one outstanding task per [`JobId`]: a push is admitted only when
//! the job has no tracked task, or the tracked one has finished or failed
//! (in which case it is evicted first). Otherwise the push is skipped and
//! `None` comes back. A skipped push is not an error.
//!
//! The lookup, eviction, task creation and tracking happen in one critical
//! section on the dedup map, so two racing pushes for the same job can never
//! both be admitted. The admitted task is handed to the [`TaskQueue`] after
//! the dedup lock is released; the queue has its own lock and nothing here
//! assumes an ordering between the two.

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tracing::debug;

use crate::event::EventKind;
use crate::model::{JobId, NewTask, Task, TaskHandle};
use crate::queue::TaskQueue;
use crate::telemetry::metrics;

/// What happened to a push.
enum Admission {
    Admitted(Task),
    Skipped(TaskHandle),
}

pub struct UniqueTaskQueue {
    queue: Arc<TaskQueue>,
    tracked: Mutex<HashMap<JobId, TaskHandle>>,
}

impl UniqueTaskQueue {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self {
            queue,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// The queue admitted tasks go to.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Queue `new` unless a task for the same job is still pending or running.
    pub fn push(&self, new: NewTask) -> Option<TaskHandle> {
        let admission = {
            let mut tracked = self.tracked.lock();

            match tracked.get(&new.job_id) {
                Some(existing) if !existing.is_done() => Admission::Skipped(existing.clone()),
                _ => {
                    let task = new.into_task();
                    // Replaces (evicts) a finished or failed predecessor
                    tracked.insert(task.job_id().clone(), task.handle());
                    Admission::Admitted(task)
                }
            }
        };

        match admission {
            Admission::Admitted(task) => {
                let handle = task.handle();
                self.queue.put_task(task);
                Some(handle)
            }
            Admission::Skipped(outstanding) => {
                debug!(
                    job_id = %outstanding.job_id(),
                    outstanding = %outstanding.id(),
                    status = %outstanding.status(),
                    "skip duplicate push"
                );
                metrics::duplicate_pushes()
                    .add(1, &[KeyValue::new("job_id", outstanding.job_id().to_string())]);
                self.queue.emit(EventKind::DuplicateSkipped {
                    job_id: outstanding.job_id().clone(),
                    outstanding: outstanding.id(),
                });
                None
            }
        }
    }

    /// The tracked task for `job_id`, if it has not finished or failed yet.
    pub fn outstanding(&self, job_id: &JobId) -> Option<TaskHandle> {
        self.tracked
            .lock()
            .get(job_id)
            .filter(|handle| !handle.is_done())
            .cloned()
    }

    /// Number of jobs currently tracked, finished ones not yet evicted included.
    pub fn tracked_len(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Drop every tracked entry whose task has finished or failed.
    pub fn evict_done(&self) -> usize {
        let mut tracked = self.tracked.lock();
        let before = tracked.len();
        tracked.retain(|_, handle| !handle.is_done());
        before - tracked.len()
    }
}
