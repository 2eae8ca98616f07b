//! The single consumer of the task queue.
//!
//! The loop polls [`TaskQueue::get`]; when nothing is eligible it sleeps for
//! `poll_interval` (or until `stop` wakes it). A task body runs on the
//! blocking pool and its outcome decides what happens to the task:
//!
//! - `Ok(())`: finished;
//! - [`JobError::Repeat`]: back to pending and re-queued at once, any number of times;
//! - a failure the task's [`RetryPolicy`](crate::retry::RetryPolicy) accepts:
//!   back to pending with `run_after` pushed out by the backoff;
//! - anything else, panics included: failed and logged.
//!
//! Nothing a task does can end the loop. There is no per-task timeout, so a
//! body that never returns stalls the worker for good.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result, panic_message};
use crate::event::EventKind;
use crate::model::{Task, TaskStatus};
use crate::queue::TaskQueue;
use crate::retry::{JobError, PANIC_KIND};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// Configuration for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to sleep when the queue has nothing eligible.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Counters of what the worker has done since it was created.
#[derive(Debug, Default)]
pub struct WorkerStats {
    finished: AtomicU64,
    failed: AtomicU64,
    repeated: AtomicU64,
    retried: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub finished: u64,
    pub failed: u64,
    pub repeated: u64,
    pub retried: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            finished: self.finished.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            repeated: self.repeated.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

type OnClose = Box<dyn FnOnce() + Send>;

/// Controls of one spawned loop. A fresh set is made by every `run`.
struct LoopControl {
    running: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

/// Background execution loop over a [`TaskQueue`].
pub struct Worker {
    queue: Arc<TaskQueue>,
    config: WorkerConfig,
    stats: Arc<WorkerStats>,
    on_close: Arc<Mutex<Option<OnClose>>>,
    current: Mutex<Option<LoopControl>>,
}

impl Worker {
    pub fn new(queue: Arc<TaskQueue>, config: WorkerConfig) -> Self {
        Self {
            queue,
            config,
            stats: Arc::new(WorkerStats::default()),
            on_close: Arc::new(Mutex::new(None)),
            current: Mutex::new(None),
        }
    }

    /// Callback fired once, after the loop has fully exited.
    pub fn on_close<F>(self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        *self.on_close.lock() = Some(Box::new(f));
        self
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|c| c.running.load(Ordering::SeqCst))
    }

    /// Start the loop on the current tokio runtime. No-op if already running.
    ///
    /// # Errors
    ///
    /// [`Error::WorkerStopping`] while a previous loop is still finishing
    /// its in-flight task: there is never more than one consumer.
    pub fn run(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("worker needs a tokio runtime: {e}")))?;

        let mut current = self.current.lock();
        if let Some(control) = current.as_ref() {
            if control.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            if !control.exited.load(Ordering::SeqCst) {
                return Err(Error::WorkerStopping);
            }
        }

        info!("starting worker");

        let running = Arc::new(AtomicBool::new(true));
        let exited = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());
        let worker_loop = WorkerLoop {
            queue: Arc::clone(&self.queue),
            poll_interval: self.config.poll_interval,
            running: Arc::clone(&running),
            exited: Arc::clone(&exited),
            shutdown: Arc::clone(&shutdown),
            stats: Arc::clone(&self.stats),
            on_close: Arc::clone(&self.on_close),
        };
        *current = Some(LoopControl {
            running,
            exited,
            shutdown,
            handle: Some(runtime.spawn(worker_loop.run())),
        });

        info!("worker is ready");
        Ok(())
    }

    /// Ask the loop to exit after its current iteration and wait for it.
    ///
    /// An in-flight task runs to completion; pending tasks stay in the queue
    /// and are reported.
    pub async fn stop(&self) -> Result<()> {
        let handle = {
            let mut current = self.current.lock();
            let Some(control) = current.as_mut() else {
                return Ok(());
            };
            if !control.running.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            control.shutdown.notify_one();
            control.handle.take()
        };

        let pending = self.queue.len();
        if pending > 0 {
            warn!(pending, "worker stopping with tasks still queued");
        }

        if let Some(handle) = handle {
            handle.await?;
        }
        info!("worker stopped");
        Ok(())
    }
}

/// State moved into the spawned loop.
struct WorkerLoop {
    queue: Arc<TaskQueue>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    stats: Arc<WorkerStats>,
    on_close: Arc<Mutex<Option<OnClose>>>,
}

impl WorkerLoop {
    async fn run(self) {
        while self.running.load(Ordering::SeqCst) {
            let Some(task) = self.queue.get() else {
                debug!("waiting for tasks");
                tokio::select! {
                    _ = self.shutdown.notified() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            };

            let queue = Arc::clone(&self.queue);
            let stats = Arc::clone(&self.stats);
            if let Err(e) = tokio::task::spawn_blocking(move || execute(&queue, &stats, task)).await {
                error!("task execution aborted: {e}");
            }
        }

        self.exited.store(true, Ordering::SeqCst);
        let on_close = self.on_close.lock().take();
        if let Some(on_close) = on_close {
            on_close();
        }
    }
}

/// Run one task and route it according to its outcome.
fn execute(queue: &TaskQueue, stats: &WorkerStats, mut task: Task) {
    let span = start_task_span(task.job_id().as_str(), &task.id());
    let _entered = span.enter();

    let ctx = match task.begin() {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(task_id = %task.id(), error = %e, "refusing to execute task");
            return;
        }
    };
    record_state_transition(&span, "pending", "in_progress");
    queue.emit(EventKind::TaskStarted {
        id: task.id(),
        job_id: task.job_id().clone(),
        attempt: ctx.attempt,
    });

    let started = Instant::now();
    let result = catch_unwind(AssertUnwindSafe(|| task.body().run(&ctx))).unwrap_or_else(|payload| {
        Err(JobError::failed(PANIC_KIND, panic_message(payload.as_ref())))
    });
    let duration_ms = started.elapsed().as_millis() as u64;
    metrics::task_duration_ms().record(
        duration_ms as f64,
        &[KeyValue::new("job_id", task.job_id().to_string())],
    );

    match result {
        Ok(()) => {
            settle(&task, TaskStatus::Finished, &span);
            stats.finished.fetch_add(1, Ordering::Relaxed);
            metrics::tasks_completed().add(1, &[KeyValue::new("status", "finished")]);
            debug!(task_id = %task.id(), job_id = %task.job_id(), duration_ms, "task finished");
            queue.emit(EventKind::TaskFinished {
                id: task.id(),
                job_id: task.job_id().clone(),
                duration_ms,
            });
        }
        Err(JobError::Repeat) => {
            settle(&task, TaskStatus::Pending, &span);
            stats.repeated.fetch_add(1, Ordering::Relaxed);
            debug!(task_id = %task.id(), job_id = %task.job_id(), "task asked to repeat");
            queue.emit(EventKind::TaskRepeated {
                id: task.id(),
                job_id: task.job_id().clone(),
                attempt: ctx.attempt,
            });
            queue.put_task(task);
        }
        Err(e) if task.retry_policy().should_retry(&e, task.retries()) => {
            let delay = task.retry_policy().delay_for(task.retries());
            task.record_retry();
            let run_after = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            task.set_run_after(Some(run_after));
            settle(&task, TaskStatus::Pending, &span);
            stats.retried.fetch_add(1, Ordering::Relaxed);
            metrics::task_retries().add(1, &[KeyValue::new("job_id", task.job_id().to_string())]);
            warn!(
                task_id = %task.id(),
                job_id = %task.job_id(),
                attempt = ctx.attempt,
                retry = task.retries(),
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "task failed, retrying"
            );
            queue.emit(EventKind::TaskRetried {
                id: task.id(),
                job_id: task.job_id().clone(),
                error: e.to_string(),
                attempt: ctx.attempt,
                run_after,
            });
            queue.put_task(task);
        }
        Err(e) => {
            settle(&task, TaskStatus::Failed, &span);
            stats.failed.fetch_add(1, Ordering::Relaxed);
            metrics::tasks_completed().add(1, &[KeyValue::new("status", "failed")]);
            error!(
                task_id = %task.id(),
                job_id = %task.job_id(),
                attempt = ctx.attempt,
                error = %e,
                "task failed"
            );
            queue.emit(EventKind::TaskFailed {
                id: task.id(),
                job_id: task.job_id().clone(),
                error: e.to_string(),
                attempt: ctx.attempt,
            });
        }
    }
}

fn settle(task: &Task, to: TaskStatus, span: &tracing::Span) {
    match task.transition(to) {
        Ok(from) => record_state_transition(span, &from.to_string(), &to.to_string()),
        Err(e) => error!(task_id = %task.id(), error = %e, "unexpected task transition"),
    }
}
