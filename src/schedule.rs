//! Recurring jobs.
//!
//! A [`Scheduler`] pushes each registered job through a
//! [`UniqueTaskQueue`] every time its interval elapses. If the previous run
//! of that job is still pending or in progress, the push is skipped, so a
//! slow job never piles up behind itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{Job, JobContext, JobId, NewTask, Priority, TaskHandle};
use crate::queue::UniqueTaskQueue;
use crate::retry::{JobError, RetryPolicy};

/// A job to push at a fixed interval.
#[derive(Clone)]
pub struct ScheduledJob {
    job_id: JobId,
    every: Duration,
    priority: Priority,
    retry_policy: RetryPolicy,
    params: serde_json::Value,
    body: Arc<dyn Job>,
}

impl ScheduledJob {
    pub fn new<F>(job_id: impl Into<JobId>, every: Duration, body: F) -> Self
    where
        F: Fn(&JobContext) -> std::result::Result<(), JobError> + Send + Sync + 'static,
    {
        Self::from_job(job_id, every, Arc::new(body))
    }

    pub fn from_job(job_id: impl Into<JobId>, every: Duration, body: Arc<dyn Job>) -> Self {
        Self {
            job_id: job_id.into(),
            every,
            priority: Priority::default(),
            retry_policy: RetryPolicy::default(),
            params: serde_json::Value::Null,
            body,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn every(&self) -> Duration {
        self.every
    }

    fn to_task(&self) -> NewTask {
        NewTask::from_job(self.job_id.clone(), Arc::clone(&self.body))
            .priority(self.priority)
            .retry_policy(self.retry_policy.clone())
            .params(self.params.clone())
    }
}

struct Entry {
    job: ScheduledJob,
    next_due: DateTime<Utc>,
}

fn after(now: DateTime<Utc>, every: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(every)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Pushes recurring jobs into a unique queue.
pub struct Scheduler {
    queue: Arc<UniqueTaskQueue>,
    tick: Duration,
    entries: Arc<Mutex<Vec<Entry>>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// `tick` is how often the background loop checks for due jobs.
    pub fn new(queue: Arc<UniqueTaskQueue>, tick: Duration) -> Self {
        Self {
            queue,
            tick,
            entries: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            handle: Mutex::new(None),
        }
    }

    /// Register a job, first due one interval from now. Returns `false`
    /// (and changes nothing) if a job with the same id is registered.
    pub fn add(&self, job: ScheduledJob) -> bool {
        self.add_at(job, Utc::now())
    }

    /// Like [`Scheduler::add`], with an explicit notion of "now".
    pub fn add_at(&self, job: ScheduledJob, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.job.job_id == job.job_id) {
            return false;
        }
        debug!(job_id = %job.job_id, every_ms = job.every.as_millis() as u64, "job scheduled");
        let next_due = after(now, job.every);
        entries.push(Entry { job, next_due });
        true
    }

    /// Unregister a job. Its queued task, if any, is left alone.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| &e.job.job_id != job_id);
        let removed = entries.len() != before;
        if removed {
            debug!(%job_id, "job unscheduled");
        }
        removed
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.entries
            .lock()
            .iter()
            .map(|e| e.job.job_id.clone())
            .collect()
    }

    /// Push every job due at `now`. Returns the tasks that were admitted;
    /// jobs whose previous task is still outstanding are skipped.
    pub fn run_pending_at(&self, now: DateTime<Utc>) -> Vec<TaskHandle> {
        run_pending(&self.entries, &self.queue, now)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the tick loop on the current tokio runtime. No-op if running.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("scheduler needs a tokio runtime: {e}")))?;

        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let entries = Arc::clone(&self.entries);
        let queue = Arc::clone(&self.queue);
        let running = Arc::clone(&self.running);
        let shutdown = Arc::clone(&self.shutdown);
        let tick = self.tick;

        *self.handle.lock() = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = shutdown.notified() => {}
                    _ = interval.tick() => {
                        run_pending(&entries, &queue, Utc::now());
                    }
                }
            }
        }));

        info!(tick_ms = self.tick.as_millis() as u64, "scheduler started");
        Ok(())
    }

    /// Stop the tick loop and wait for it to exit.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.notify_one();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.await?;
        }
        info!("scheduler stopped");
        Ok(())
    }
}

fn run_pending(
    entries: &Mutex<Vec<Entry>>,
    queue: &UniqueTaskQueue,
    now: DateTime<Utc>,
) -> Vec<TaskHandle> {
    let due: Vec<ScheduledJob> = {
        let mut entries = entries.lock();
        entries
            .iter_mut()
            .filter(|e| e.next_due <= now)
            .map(|e| {
                e.next_due = after(now, e.job.every);
                e.job.clone()
            })
            .collect()
    };

    due.iter().filter_map(|job| queue.push(job.to_task())).collect()
}
