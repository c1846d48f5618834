//! Structured events emitted on every task state transition.
//!
//! Dashboards subscribe to the event stream through the broadcaster to stay
//! in sync without polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{SessionId, Status, TaskId, UserId};

/// An event as delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Observers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    NewTask {
        task_id: TaskId,
        source_ref: String,
    },
    Claimed {
        task_id: TaskId,
        user_id: UserId,
        session_id: SessionId,
    },
    Released {
        task_id: TaskId,
        reason: String,
    },
    Verified {
        task_id: TaskId,
        /// `verified` or `rejected`.
        status: Status,
        verified_by: UserId,
        has_edits: bool,
    },
    Reclaimed {
        task_id: TaskId,
        retry_count: u32,
        timeout_count: u32,
        dead_lettered: bool,
    },
}

impl EventKind {
    pub fn task_id(&self) -> TaskId {
        match self {
            EventKind::NewTask { task_id, .. }
            | EventKind::Claimed { task_id, .. }
            | EventKind::Released { task_id, .. }
            | EventKind::Verified { task_id, .. }
            | EventKind::Reclaimed { task_id, .. } => *task_id,
        }
    }

    /// Wire name, also used as a metrics label.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::NewTask { .. } => "new_task",
            EventKind::Claimed { .. } => "claimed",
            EventKind::Released { .. } => "released",
            EventKind::Verified { .. } => "verified",
            EventKind::Reclaimed { .. } => "reclaimed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_flat_with_type_tag() {
        let task_id = TaskId::new();
        let event = Event {
            seq: 7,
            timestamp: Utc::now(),
            kind: EventKind::Released {
                task_id,
                reason: "break".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "released");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["task_id"], task_id.0.to_string());
        assert_eq!(json["reason"], "break");
    }
}
