//! Integration tests for telemetry initialization and span helpers.

use reviewq::model::{Status, TaskId};
use reviewq::telemetry::task::{record_state_transition, record_task, start_task_span};
use reviewq::telemetry::{TelemetryConfig, init_telemetry};

#[test]
fn telemetry_initializes_without_endpoint() {
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "reviewq-test".to_string(),
        log_level: "debug".to_string(),
    };
    // A global subscriber can only be installed once per process; a second
    // attempt reports an error instead of panicking.
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn task_span_records_transition() {
    let span = start_task_span("submit", Some(TaskId::new()));
    record_state_transition(&span, Status::InProgress, Status::Verified);
}

#[test]
fn claim_span_takes_task_id_later() {
    let span = start_task_span("claim", None);
    record_task(&span, TaskId::new());
    record_state_transition(&span, Status::Pending, Status::InProgress);
}
