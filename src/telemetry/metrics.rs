//! Metric instrument factories for reviewq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"reviewq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for reviewq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("reviewq")
}

/// Counter: feed items processed.
/// Labels: `result` ("created" | "duplicate" | "malformed" | "error").
pub fn tasks_ingested() -> Counter<u64> {
    meter()
        .u64_counter("reviewq.tasks.ingested")
        .with_description("Number of upstream items processed by the queue processor")
        .build()
}

/// Counter: claim attempts.
/// Labels: `result` ("claimed" | "resumed" | "empty" | "contention").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("reviewq.tasks.claims")
        .with_description("Number of claim_next calls by outcome")
        .build()
}

/// Counter: task state transitions.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("reviewq.tasks.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: conditional updates that lost to a concurrent writer.
/// Labels: `operation`.
pub fn lost_races() -> Counter<u64> {
    meter()
        .u64_counter("reviewq.tasks.lost_races")
        .with_description("Conditional updates whose predicate no longer held")
        .build()
}

/// Counter: reclaim sweep results per task.
/// Labels: `result` ("pending" | "dead_letter" | "skipped" | "error").
pub fn reclaims() -> Counter<u64> {
    meter()
        .u64_counter("reviewq.reclaim.tasks")
        .with_description("Stale claims processed by the reclaim sweep")
        .build()
}

/// Histogram: sweep duration in milliseconds.
/// Labels: `operation` ("reclaim.sweep" | "ingest.batch").
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("reviewq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: events fanned out.
/// Labels: `type`.
pub fn events_broadcast() -> Counter<u64> {
    meter()
        .u64_counter("reviewq.events.broadcast")
        .with_description("Number of events broadcast to observers")
        .build()
}

/// Counter: observer connections removed because their receiver was gone.
pub fn observers_pruned() -> Counter<u64> {
    meter()
        .u64_counter("reviewq.observers.pruned")
        .with_description("Observer connections pruned during broadcast")
        .build()
}

/// Counter: events dropped from slow observers' queues.
pub fn observer_lag() -> Counter<u64> {
    meter()
        .u64_counter("reviewq.observers.lagged_events")
        .with_description("Events overwritten in a slow observer's queue")
        .build()
}

/// Counter: session lifecycle events.
/// Labels: `event` ("opened" | "expired" | "logout" | "terminated").
pub fn sessions() -> Counter<u64> {
    meter()
        .u64_counter("reviewq.sessions")
        .with_description("Session lifecycle events")
        .build()
}

/// Counter: pgmq operations.
/// Labels: `queue`, `operation` ("create" | "send" | "read" | "read_empty" | "archive").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("reviewq.queue.operations")
        .with_description("Number of pgmq operations by queue and kind")
        .build()
}
