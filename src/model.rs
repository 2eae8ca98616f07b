//! Core data model.
//!
//! A task is a unit of deferred work: a job body plus the scheduling metadata
//! the queue and worker need (priority, retry policy, run-after time) and a
//! lifecycle status. The job is identified by a caller-supplied [`JobId`],
//! which is also the dedup key used by the unique queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::retry::{JobError, RetryPolicy};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable, caller-chosen name of a job (e.g. "camera.check-status").
///
/// Two tasks with the same job id are "the same recurring job" as far as
/// [`UniqueTaskQueue`](crate::queue::UniqueTaskQueue) is concerned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Task urgency. `High` is served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(Error::Other(format!("unknown priority: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, waiting for the worker.
    Pending,
    /// The worker is executing the body.
    InProgress,
    /// Done successfully. Terminal.
    Finished,
    /// Failed and not retried. Terminal.
    Failed,
}

impl TaskStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Finished)
                | (InProgress, Failed)
                | (InProgress, Pending) // repeat or retry
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Finished => "finished",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// What a job body sees while it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub task_id: TaskId,
    pub job_id: JobId,
    /// Parameters bound when the task was created. Opaque to the queue.
    pub params: serde_json::Value,
    /// 1 on the first execution, incremented on every repeat or retry.
    pub attempt: u32,
}

/// The executable part of a task.
///
/// Implemented for any `Fn(&JobContext) -> Result<(), JobError>`; implement it
/// directly for jobs that carry their own state.
pub trait Job: Send + Sync {
    fn run(&self, ctx: &JobContext) -> std::result::Result<(), JobError>;
}

impl<F> Job for F
where
    F: Fn(&JobContext) -> std::result::Result<(), JobError> + Send + Sync,
{
    fn run(&self, ctx: &JobContext) -> std::result::Result<(), JobError> {
        self(ctx)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Status and counters, shared between the task and its handles.
///
/// Only the current owner of the [`Task`] writes here; handles only read.
#[derive(Debug)]
struct TaskShared {
    status: watch::Sender<TaskStatus>,
    /// Executions started, repeats and retries included.
    attempts: AtomicU32,
    /// Retries granted by the retry policy. Repeats do not count.
    retries: AtomicU32,
}

/// A unit of work held by the queue or by the worker executing it.
pub struct Task {
    id: TaskId,
    job_id: JobId,
    body: Arc<dyn Job>,
    params: serde_json::Value,
    priority: Priority,
    retry_policy: RetryPolicy,
    run_after: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    shared: Arc<TaskShared>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("job_id", &self.job_id)
            .field("priority", &self.priority)
            .field("status", &self.status())
            .field("attempts", &self.attempts())
            .field("retries", &self.retries())
            .field("run_after", &self.run_after)
            .finish()
    }
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn params(&self) -> &serde_json::Value {
        &self.params
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn run_after(&self) -> Option<DateTime<Utc>> {
        self.run_after
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> TaskStatus {
        *self.shared.status.borrow()
    }

    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Acquire)
    }

    pub fn retries(&self) -> u32 {
        self.shared.retries.load(Ordering::Acquire)
    }

    /// Whether the task may run at `now`.
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.run_after.is_none_or(|at| at <= now)
    }

    /// A read-only view that outlives the task's trip through the queue.
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            id: self.id,
            job_id: self.job_id.clone(),
            priority: self.priority,
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn set_run_after(&mut self, at: Option<DateTime<Utc>>) {
        self.run_after = at;
    }

    /// Count one retry granted by the policy.
    pub(crate) fn record_retry(&self) {
        self.shared.retries.fetch_add(1, Ordering::AcqRel);
    }

    /// Move to `to`, returning the previous status.
    pub(crate) fn transition(&self, to: TaskStatus) -> Result<TaskStatus> {
        let mut outcome = Err(Error::Other("status unchanged".to_string()));
        self.shared.status.send_if_modified(|current| {
            if current.can_transition_to(to) {
                outcome = Ok(std::mem::replace(current, to));
                true
            } else {
                outcome = Err(Error::InvalidTransition { from: *current, to });
                false
            }
        });
        outcome
    }

    /// Mark the task in progress and count the attempt. Returns the context
    /// to hand to the body.
    pub(crate) fn begin(&self) -> Result<JobContext> {
        self.transition(TaskStatus::InProgress)?;
        let attempt = self.shared.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(JobContext {
            task_id: self.id,
            job_id: self.job_id.clone(),
            params: self.params.clone(),
            attempt,
        })
    }

    pub(crate) fn body(&self) -> &Arc<dyn Job> {
        &self.body
    }
}

/// Read-only view of a task, returned to whoever scheduled it.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    job_id: JobId,
    priority: Priority,
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn status(&self) -> TaskStatus {
        *self.shared.status.borrow()
    }

    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Acquire)
    }

    /// Retries granted so far. Repeats do not count.
    pub fn retries(&self) -> u32 {
        self.shared.retries.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// Wait until the task is finished or failed.
    ///
    /// A job that keeps requesting repeats never gets there.
    pub async fn wait(&self) -> TaskStatus {
        let mut rx = self.shared.status.subscribe();
        match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new tasks. The queue's public API for scheduling work.
pub struct NewTask {
    pub(crate) job_id: JobId,
    pub(crate) body: Arc<dyn Job>,
    pub(crate) params: serde_json::Value,
    pub(crate) priority: Priority,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) run_after: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new<F>(job_id: impl Into<JobId>, body: F) -> Self
    where
        F: Fn(&JobContext) -> std::result::Result<(), JobError> + Send + Sync + 'static,
    {
        Self::from_job(job_id, Arc::new(body))
    }

    /// Build from an already shared job, e.g. one that is scheduled repeatedly.
    pub fn from_job(job_id: impl Into<JobId>, body: Arc<dyn Job>) -> Self {
        Self {
            job_id: job_id.into(),
            body,
            params: serde_json::Value::Null,
            priority: Priority::default(),
            retry_policy: RetryPolicy::default(),
            run_after: None,
        }
    }

    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Not eligible for execution before `at`.
    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }

    /// Not eligible for execution before `delay` from now.
    pub fn delay(self, delay: std::time::Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.run_after(at)
    }

    pub(crate) fn into_task(self) -> Task {
        let (status, _) = watch::channel(TaskStatus::Pending);
        Task {
            id: TaskId::new(),
            job_id: self.job_id,
            body: self.body,
            params: self.params,
            priority: self.priority,
            retry_policy: self.retry_policy,
            run_after: self.run_after,
            created_at: Utc::now(),
            shared: Arc::new(TaskShared {
                status,
                attempts: AtomicU32::new(0),
                retries: AtomicU32::new(0),
            }),
        }
    }
}
