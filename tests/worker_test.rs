//! Integration tests for the worker loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use homeguard::error::Error;
use homeguard::event::EventKind;
use homeguard::model::*;
use homeguard::queue::TaskQueue;
use homeguard::retry::{BackoffPolicy, JobError, RetryPolicy};
use homeguard::worker::{Worker, WorkerConfig};
use parking_lot::Mutex;
use tokio::sync::Notify;

fn fast_worker(queue: &Arc<TaskQueue>) -> Worker {
    Worker::new(
        Arc::clone(queue),
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
        },
    )
}

async fn settled(handle: &TaskHandle) -> TaskStatus {
    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("task did not settle in time")
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_task_is_finished() {
    let queue = Arc::new(TaskQueue::new());
    let worker = fast_worker(&queue);
    worker.run().unwrap();

    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let handle = queue.put(
        NewTask::new("greet", move |ctx| {
            *sink.lock() = Some(ctx.params["name"].as_str().unwrap_or_default().to_string());
            Ok(())
        })
        .params(serde_json::json!({"name": "kitchen"})),
    );

    assert_eq!(settled(&handle).await, TaskStatus::Finished);
    assert_eq!(handle.attempts(), 1);
    assert_eq!(seen.lock().as_deref(), Some("kitchen"));

    worker.stop().await.unwrap();
    assert_eq!(worker.stats().finished, 1);
}

#[tokio::test]
async fn failing_task_does_not_stop_the_loop() {
    let queue = Arc::new(TaskQueue::new());
    let worker = fast_worker(&queue);
    worker.run().unwrap();

    let failing = queue.put(NewTask::new("broken", |_ctx| {
        Err(JobError::failed("io", "sensor unplugged"))
    }));
    let after = queue.put(NewTask::new("after", |_ctx| Ok(())));

    assert_eq!(settled(&failing).await, TaskStatus::Failed);
    assert_eq!(settled(&after).await, TaskStatus::Finished);
    assert!(worker.is_running());

    worker.stop().await.unwrap();
    let stats = worker.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.finished, 1);
}

#[tokio::test]
async fn panicking_task_is_failed_and_contained() {
    let queue = Arc::new(TaskQueue::new());
    let worker = fast_worker(&queue);
    worker.run().unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    queue.events().connect(move |event| {
        if let EventKind::TaskFailed { error, .. } = &event.kind {
            sink.lock().push(error.clone());
        }
        Ok(())
    });

    let panicking = queue.put(NewTask::new("panics", |_ctx| panic!("camera exploded")));
    let after = queue.put(NewTask::new("after", |_ctx| Ok(())));

    assert_eq!(settled(&panicking).await, TaskStatus::Failed);
    assert_eq!(settled(&after).await, TaskStatus::Finished);

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("camera exploded"), "got {errors:?}");

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn repeat_requeues_without_limit() {
    let queue = Arc::new(TaskQueue::new());
    let worker = fast_worker(&queue);

    let repeats = Arc::new(AtomicU32::new(0));
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let repeat_sink = Arc::clone(&repeats);
    queue.events().connect(move |event| {
        if matches!(event.kind, EventKind::TaskRepeated { .. }) {
            repeat_sink.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });

    // More repeats than any sane retry budget
    let status_sink = Arc::clone(&statuses);
    let handle = queue.put(
        NewTask::new("poll-until-ready", move |ctx| {
            status_sink.lock().push(ctx.attempt);
            if ctx.attempt < 12 {
                Err(JobError::repeat())
            } else {
                Ok(())
            }
        })
        .retry_policy(RetryPolicy::new(0)),
    );
    worker.run().unwrap();

    assert_eq!(settled(&handle).await, TaskStatus::Finished);
    assert_eq!(handle.attempts(), 12);
    assert_eq!(repeats.load(Ordering::SeqCst), 11);
    assert_eq!(*statuses.lock(), (1..=12).collect::<Vec<_>>());

    worker.stop().await.unwrap();
    assert_eq!(worker.stats().repeated, 11);
}

#[tokio::test]
async fn repeating_task_stays_pending_until_it_succeeds() {
    let queue = Arc::new(TaskQueue::new());
    let worker = fast_worker(&queue);

    let gate = Arc::new(AtomicBool::new(false));
    let body_gate = Arc::clone(&gate);
    let handle = queue.put(NewTask::new("wait-for-gate", move |_ctx| {
        if body_gate.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(JobError::repeat())
        }
    }));

    worker.run().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handle.attempts() >= 2, "task should have repeated");
    assert!(!handle.is_done());

    gate.store(true, Ordering::SeqCst);
    assert_eq!(settled(&handle).await, TaskStatus::Finished);
    worker.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

fn quick_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries)
        .retry_on("timeout")
        .backoff(BackoffPolicy::constant(Duration::from_millis(20)))
}

#[tokio::test]
async fn retryable_failure_is_retried_then_succeeds() {
    let queue = Arc::new(TaskQueue::new());
    let worker = fast_worker(&queue);
    worker.run().unwrap();

    let handle = queue.put(
        NewTask::new("flaky", |ctx| {
            if ctx.attempt < 3 {
                Err(JobError::failed("timeout", "router did not answer"))
            } else {
                Ok(())
            }
        })
        .retry_policy(quick_retries(3)),
    );

    assert_eq!(settled(&handle).await, TaskStatus::Finished);
    assert_eq!(handle.attempts(), 3);

    worker.stop().await.unwrap();
    assert_eq!(worker.stats().retried, 2);
}

#[tokio::test]
async fn retries_stop_when_budget_is_spent() {
    let queue = Arc::new(TaskQueue::new());
    let worker = fast_worker(&queue);
    worker.run().unwrap();

    let handle = queue.put(
        NewTask::new("always-times-out", |_ctx| {
            Err(JobError::failed("timeout", "still nothing"))
        })
        .retry_policy(quick_retries(2)),
    );

    assert_eq!(settled(&handle).await, TaskStatus::Failed);
    assert_eq!(handle.attempts(), 3, "first attempt plus two retries");

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn unlisted_failure_kind_is_not_retried() {
    let queue = Arc::new(TaskQueue::new());
    let worker = fast_worker(&queue);
    worker.run().unwrap();

    let handle = queue.put(
        NewTask::new("bad-input", |_ctx| Err(JobError::failed("parse", "garbage")))
            .retry_policy(quick_retries(5)),
    );

    assert_eq!(settled(&handle).await, TaskStatus::Failed);
    assert_eq!(handle.attempts(), 1);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn retry_waits_for_backoff() {
    let queue = Arc::new(TaskQueue::new());
    let worker = fast_worker(&queue);
    worker.run().unwrap();

    let handle = queue.put(
        NewTask::new("slow-retry", |ctx| {
            if ctx.attempt == 1 {
                Err(JobError::failed("timeout", "first try"))
            } else {
                Ok(())
            }
        })
        .retry_policy(
            RetryPolicy::new(1)
                .retry_on("timeout")
                .backoff(BackoffPolicy::constant(Duration::from_secs(60))),
        ),
    );

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(handle.status(), TaskStatus::Pending);
    assert_eq!(handle.attempts(), 1);
    assert_eq!(queue.len(), 1);
    assert!(queue.next_run_after().is_some());

    worker.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_twice_is_a_noop() {
    let queue = Arc::new(TaskQueue::new());
    let worker = fast_worker(&queue);

    worker.run().unwrap();
    worker.run().unwrap();
    assert!(worker.is_running());

    let handle = queue.put(NewTask::new("once", |_ctx| Ok(())));
    assert_eq!(settled(&handle).await, TaskStatus::Finished);

    worker.stop().await.unwrap();
    assert!(!worker.is_running());
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn stop_waits_for_in_flight_task_and_leaves_pending_ones() {
    let queue = Arc::new(TaskQueue::new());
    let worker = fast_worker(&queue);
    worker.run().unwrap();

    let started = Arc::new(Notify::new());
    let completed = Arc::new(AtomicBool::new(false));
    let (started_tx, completed_tx) = (Arc::clone(&started), Arc::clone(&completed));
    let in_flight = queue.put(NewTask::new("slow", move |_ctx| {
        started_tx.notify_one();
        std::thread::sleep(Duration::from_millis(200));
        completed_tx.store(true, Ordering::SeqCst);
        Ok(())
    }));

    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("slow task never started");
    let never_run = queue.put(NewTask::new("abandoned", |_ctx| Ok(())));

    worker.stop().await.unwrap();

    assert!(completed.load(Ordering::SeqCst), "stop returned before the task ended");
    assert_eq!(in_flight.status(), TaskStatus::Finished);
    assert_eq!(never_run.status(), TaskStatus::Pending);
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn on_close_fires_once_after_loop_exit() {
    let queue = Arc::new(TaskQueue::new());
    let closed = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&closed);
    let worker = fast_worker(&queue).on_close(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    worker.run().unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 0);
    worker.stop().await.unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    worker.run().unwrap();
    worker.stop().await.unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[test]
fn run_outside_a_runtime_is_an_error() {
    let queue = Arc::new(TaskQueue::new());
    let worker = fast_worker(&queue);
    assert!(worker.run().is_err());
    assert!(!worker.is_running());
}

#[tokio::test]
async fn lifecycle_events_arrive_in_order() {
    let queue = Arc::new(TaskQueue::new());
    let worker = fast_worker(&queue);

    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&kinds);
    queue.events().connect(move |event| {
        let name = match event.kind {
            EventKind::TaskQueued { .. } => "queued",
            EventKind::TaskStarted { .. } => "started",
            EventKind::TaskFinished { .. } => "finished",
            EventKind::TaskFailed { .. } => "failed",
            EventKind::TaskRetried { .. } => "retried",
            EventKind::TaskRepeated { .. } => "repeated",
            EventKind::DuplicateSkipped { .. } => "duplicate",
        };
        sink.lock().push(name);
        Ok(())
    });

    let handle = queue.put(NewTask::new("twice", |ctx| {
        if ctx.attempt == 1 {
            Err(JobError::repeat())
        } else {
            Ok(())
        }
    }));
    worker.run().unwrap();
    settled(&handle).await;
    worker.stop().await.unwrap();

    assert_eq!(
        *kinds.lock(),
        ["queued", "started", "repeated", "queued", "started", "finished"]
    );
}

#[tokio::test]
async fn repeats_do_not_spend_the_retry_budget() {
    let queue = Arc::new(TaskQueue::new());
    let worker = fast_worker(&queue);
    worker.run().unwrap();

    let handle = queue.put(
        NewTask::new("warm-up-then-flaky", |ctx| match ctx.attempt {
            1 | 2 => Err(JobError::repeat()),
            3 => Err(JobError::failed("timeout", "router slow to answer")),
            _ => Ok(()),
        })
        .retry_policy(quick_retries(2)),
    );

    assert_eq!(settled(&handle).await, TaskStatus::Finished);
    assert_eq!(handle.attempts(), 4);
    assert_eq!(handle.retries(), 1);

    worker.stop().await.unwrap();
    let stats = worker.stats();
    assert_eq!(stats.repeated, 2);
    assert_eq!(stats.retried, 1);
}

#[tokio::test]
async fn full_retry_budget_is_available_after_many_repeats() {
    let queue = Arc::new(TaskQueue::new());
    let worker = fast_worker(&queue);
    worker.run().unwrap();

    // Five repeats, then two timeouts, then success: needs both retries.
    let handle = queue.put(
        NewTask::new("patient", |ctx| match ctx.attempt {
            1..=5 => Err(JobError::repeat()),
            6 | 7 => Err(JobError::failed("timeout", "still booting")),
            _ => Ok(()),
        })
        .retry_policy(quick_retries(2)),
    );

    assert_eq!(settled(&handle).await, TaskStatus::Finished);
    assert_eq!(handle.attempts(), 8);
    assert_eq!(handle.retries(), 2);

    worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_during_stop_does_not_start_a_second_loop() {
    let queue = Arc::new(TaskQueue::new());
    let worker = Arc::new(fast_worker(&queue));
    worker.run().unwrap();

    let started = Arc::new(Notify::new());
    let started_tx = Arc::clone(&started);
    queue.put(NewTask::new("slow", move |_ctx| {
        started_tx.notify_one();
        std::thread::sleep(Duration::from_millis(300));
        Ok(())
    }));
    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("slow task never started");

    let stopping = Arc::clone(&worker);
    let stop = tokio::spawn(async move { stopping.stop().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(worker.run(), Err(Error::WorkerStopping)));
    assert!(!worker.is_running());

    tokio::time::timeout(Duration::from_secs(2), stop)
        .await
        .expect("stop did not return after the in-flight task")
        .unwrap()
        .unwrap();

    // Restart works once the old loop is gone, and only one loop consumes.
    let concurrent = Arc::new(AtomicU32::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let (concurrent, overlapped) = (Arc::clone(&concurrent), Arc::clone(&overlapped));
            queue.put(NewTask::new(format!("after-restart-{i}"), move |_ctx| {
                if concurrent.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.store(true, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_millis(10));
                concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }))
        })
        .collect();
    worker.run().unwrap();
    for handle in &handles {
        assert_eq!(settled(handle).await, TaskStatus::Finished);
    }
    assert!(!overlapped.load(Ordering::SeqCst));

    worker.stop().await.unwrap();
}
