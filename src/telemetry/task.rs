//! Task execution span helpers.
//!
//! Provides span creation and state-transition recording for tasks
//! flowing through the worker.

use tracing::Span;

use crate::model::TaskId;

/// Start a span for one execution of a task.
///
/// The `task.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_task_span(job_id: &str, task_id: &TaskId) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.job_id" = job_id,
        "task.id" = %task_id,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span.
///
/// Emits a tracing `debug` event scoped to the span and updates its
/// `task.state` field.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
