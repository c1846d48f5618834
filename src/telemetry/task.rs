//! Task operation span helpers.
//!
//! Provides span creation and state-transition recording for tasks moving
//! through claim, edit, submit, release and reclaim.

use tracing::Span;

use crate::model::{Status, TaskId};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Start a span for one engine operation on a task.
///
/// `task.id` is declared empty for operations that pick their task while
/// running (claim); fill it with [`record_task`].
pub fn start_task_span(operation: &'static str, task_id: Option<TaskId>) -> Span {
    let span = tracing::info_span!(
        "task.operation",
        "task.operation" = operation,
        "task.id" = tracing::field::Empty,
        "task.state" = tracing::field::Empty,
    );
    if let Some(id) = task_id {
        record_task(&span, id);
    }
    span
}

/// Attach the task id to a span created before the task was known.
pub fn record_task(span: &Span, task_id: TaskId) {
    span.record("task.id", tracing::field::display(task_id));
}

/// Record a state transition on the span and count it.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.record("task.state", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
    metrics::task_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}
