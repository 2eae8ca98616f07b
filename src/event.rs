//! Structured events emitted on every task state change.
//!
//! The task queue publishes these on its lifecycle [`Signal`](crate::signal::Signal).
//! Consumers connect to it for dashboards, audit logs, or user-facing
//! reports of failed jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{JobId, Priority, TaskId};

/// A structured event emitted by the queue or the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique, gap-free sequence number per queue. Events emitted from
    /// different threads at the same moment may be delivered out of `seq`
    /// order; sort by it to recover emission order. Events about one task
    /// always arrive in order.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TaskQueued {
        id: TaskId,
        job_id: JobId,
        priority: Priority,
        run_after: Option<DateTime<Utc>>,
    },
    TaskStarted {
        id: TaskId,
        job_id: JobId,
        attempt: u32,
    },
    TaskFinished {
        id: TaskId,
        job_id: JobId,
        duration_ms: u64,
    },
    TaskFailed {
        id: TaskId,
        job_id: JobId,
        error: String,
        attempt: u32,
    },
    TaskRetried {
        id: TaskId,
        job_id: JobId,
        error: String,
        attempt: u32,
        run_after: DateTime<Utc>,
    },
    TaskRepeated {
        id: TaskId,
        job_id: JobId,
        attempt: u32,
    },
    DuplicateSkipped {
        job_id: JobId,
        outstanding: TaskId,
    },
}

impl EventKind {
    /// The job this event is about.
    pub fn job_id(&self) -> &JobId {
        match self {
            EventKind::TaskQueued { job_id, .. }
            | EventKind::TaskStarted { job_id, .. }
            | EventKind::TaskFinished { job_id, .. }
            | EventKind::TaskFailed { job_id, .. }
            | EventKind::TaskRetried { job_id, .. }
            | EventKind::TaskRepeated { job_id, .. }
            | EventKind::DuplicateSkipped { job_id, .. } => job_id,
        }
    }
}
