//! Task, edit and statistics types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::session::{SessionId, UserId};

/// Field name → value snapshot of a reviewable record.
pub type FieldMap = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A reviewable record tracked by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Identifier of the upstream item. Unique across all tasks; this is the
    /// ingestion dedup key.
    pub source_ref: String,

    /// Snapshot taken at ingestion. Never modified.
    pub original_data: FieldMap,

    /// Working copy the verifier edits.
    pub current_data: FieldMap,

    pub has_edits: bool,

    /// Number of distinct fields ever edited.
    pub edit_count: u32,

    pub status: Status,

    pub assigned_session: Option<SessionId>,
    pub assigned_user: Option<UserId>,
    pub assigned_at: Option<DateTime<Utc>>,

    /// `true` for verified, `false` for rejected, unset otherwise.
    pub is_verified: Option<bool>,
    pub verified_by: Option<UserId>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_notes: Option<String>,

    /// Times the task went back to the pool without being finalized
    /// (reclaims and revision requests).
    pub retry_count: u32,

    /// Times the task was reclaimed because its claim went stale.
    pub timeout_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A fresh pending task whose working copy equals its snapshot.
    pub fn new_pending(source_ref: impl Into<String>, data: FieldMap, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            source_ref: source_ref.into(),
            current_data: data.clone(),
            original_data: data,
            has_edits: false,
            edit_count: 0,
            status: Status::Pending,
            assigned_session: None,
            assigned_user: None,
            assigned_at: None,
            is_verified: None,
            verified_by: None,
            verified_at: None,
            verification_notes: None,
            retry_count: 0,
            timeout_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_claimed_by(&self, session: SessionId) -> bool {
        self.status == Status::InProgress && self.assigned_session == Some(session)
    }

    /// FIFO key for claiming.
    pub fn queue_position(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id.0)
    }
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// In the pool, claimable.
    Pending,
    /// Claimed by exactly one session.
    InProgress,
    /// Approved by a verifier. Terminal.
    Verified,
    /// Rejected by a verifier. Terminal.
    Rejected,
    /// Exhausted its retry budget. Terminal until an operator intervenes.
    DeadLetter,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Verified | Status::Rejected | Status::DeadLetter)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Verified => "verified",
            Status::Rejected => "rejected",
            Status::DeadLetter => "dead_letter",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "in_progress" => Ok(Status::InProgress),
            "verified" => Ok(Status::Verified),
            "rejected" => Ok(Status::Rejected),
            "dead_letter" => Ok(Status::DeadLetter),
            other => Err(crate::error::Error::Other(format!("unknown task status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Edits
// ---------------------------------------------------------------------------

/// One row per (task, field). `original_value` is captured on the first edit
/// and never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    pub id: Uuid,
    pub task_id: TaskId,
    pub field_name: String,
    pub original_value: Value,
    pub current_value: Value,
    pub edited_by: UserId,
    pub edited_at: DateTime<Utc>,
    pub edit_reason: Option<String>,
}

/// A requested change to one field of the working copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub value: Value,
    #[serde(default)]
    pub reason: Option<String>,
}

impl FieldChange {
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            reason: None,
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Review outcome
// ---------------------------------------------------------------------------

/// What the verifier decided when submitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approved,
    ApprovedWithChanges,
    /// Back to the pool for another pass.
    NeedsRevision,
    Rejected,
}

impl ReviewAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewAction::Approved => "approved",
            ReviewAction::ApprovedWithChanges => "approved_with_changes",
            ReviewAction::NeedsRevision => "needs_revision",
            ReviewAction::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Aggregate counts for the dashboard. A point-in-time snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: u64,
    pub in_progress: u64,
    pub verified_total: u64,
    pub verified_today: u64,
    pub approved_with_changes_total: u64,
    pub rejected_total: u64,
    pub rejected_today: u64,
    pub dead_letter: u64,
    /// Tasks currently claimed by the requesting user (any of their sessions).
    pub mine_in_progress: u64,
    /// Tasks the requesting user finalized today.
    pub mine_verified_today: u64,
}
