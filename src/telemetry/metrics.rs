//! Metric instrument factories for homeguard.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"homeguard"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for homeguard instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("homeguard")
}

/// Counter: tasks put on the queue, re-queues included.
/// Labels: `priority`.
pub fn tasks_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("homeguard.tasks.enqueued")
        .with_description("Number of tasks put on the queue")
        .build()
}

/// Counter: tasks that reached a terminal status.
/// Labels: `status` ("finished" | "failed").
pub fn tasks_completed() -> Counter<u64> {
    meter()
        .u64_counter("homeguard.tasks.completed")
        .with_description("Number of tasks that finished or failed")
        .build()
}

/// Counter: retries scheduled by a task's retry policy.
/// Labels: `job_id`.
pub fn task_retries() -> Counter<u64> {
    meter()
        .u64_counter("homeguard.tasks.retries")
        .with_description("Number of task retries scheduled")
        .build()
}

/// Counter: pushes skipped because the job already had an outstanding task.
/// Labels: `job_id`.
pub fn duplicate_pushes() -> Counter<u64> {
    meter()
        .u64_counter("homeguard.unique.duplicates")
        .with_description("Number of duplicate job pushes skipped")
        .build()
}

/// Counter: signal subscribers that returned an error or panicked.
/// Labels: `signal`.
pub fn subscriber_failures() -> Counter<u64> {
    meter()
        .u64_counter("homeguard.signal.subscriber_failures")
        .with_description("Number of failed signal deliveries")
        .build()
}

/// Histogram: task body duration in milliseconds.
/// Labels: `job_id`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("homeguard.task.duration_ms")
        .with_description("Task execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
