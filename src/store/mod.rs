//! Persistence contract used by the engine.
//!
//! The engine never holds an in-process lock across a store call. Every
//! mutation is a single [`TaskStore::conditional_update`] whose [`Guard`] is
//! re-checked at write time, so a caller that lost a race sees `None` rather
//! than overwriting someone else's transition. Two adapters implement the
//! contract: [`memory::MemoryStore`] and the Postgres-backed [`crate::db::Db`].

pub mod memory;

use chrono::{DateTime, Utc};
use std::future::Future;

use crate::error::Result;
use crate::model::{
    Edit, FieldChange, Session, SessionId, Status, Task, TaskId, TaskStats, User, UserId,
};

pub use memory::MemoryStore;

// ---------------------------------------------------------------------------
// Predicates and patches
// ---------------------------------------------------------------------------

/// Write-time predicate for a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub status: Status,
    /// When set, the task must be assigned to exactly this session.
    pub assigned_session: Option<SessionId>,
    /// When set, the claim must have been taken at exactly this instant.
    pub assigned_at: Option<DateTime<Utc>>,
    /// When set, this session must hold no in-progress task at write time.
    pub free_session: Option<SessionId>,
}

impl Guard {
    pub fn status(status: Status) -> Self {
        Self {
            status,
            assigned_session: None,
            assigned_at: None,
            free_session: None,
        }
    }

    /// Pending, and `session` holds nothing yet.
    pub fn claimable_by(session: SessionId) -> Self {
        Self {
            free_session: Some(session),
            ..Self::status(Status::Pending)
        }
    }

    /// In progress and held by `session`.
    pub fn claimed_by(session: SessionId) -> Self {
        Self {
            status: Status::InProgress,
            assigned_session: Some(session),
            assigned_at: None,
            free_session: None,
        }
    }

    /// The exact claim observed on `task`. A release followed by a fresh
    /// claim from the same session does not match.
    pub fn same_claim(task: &Task) -> Self {
        Self {
            status: task.status,
            assigned_session: task.assigned_session,
            assigned_at: task.assigned_at,
            free_session: None,
        }
    }

    /// The per-row part of the predicate. `free_session` spans rows and is
    /// checked by the store.
    pub fn matches(&self, task: &Task) -> bool {
        task.status == self.status
            && self
                .assigned_session
                .is_none_or(|s| task.assigned_session == Some(s))
            && self.assigned_at.is_none_or(|at| task.assigned_at == Some(at))
    }
}

/// How a patch changes the claim columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Assignment {
    #[default]
    Keep,
    Assign {
        session: SessionId,
        user: UserId,
        at: DateTime<Utc>,
    },
    Clear,
}

/// Verification stamp written when a task is finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub is_verified: bool,
    pub by: UserId,
    pub at: DateTime<Utc>,
}

/// Field edits applied in the same write as the rest of the patch.
#[derive(Debug, Clone, PartialEq)]
pub struct EditBatch {
    pub by: UserId,
    pub changes: Vec<FieldChange>,
}

/// Column changes for a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPatch {
    pub status: Option<Status>,
    pub assignment: Assignment,
    pub verification: Option<Verification>,
    /// Replaces `verification_notes` when set.
    pub notes: Option<String>,
    pub edits: Option<EditBatch>,
    pub retry_increment: u32,
    pub timeout_increment: u32,
    pub updated_at: DateTime<Utc>,
}

impl TaskPatch {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            status: None,
            assignment: Assignment::Keep,
            verification: None,
            notes: None,
            edits: None,
            retry_increment: 0,
            timeout_increment: 0,
            updated_at: now,
        }
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn assign(mut self, session: SessionId, user: UserId) -> Self {
        self.assignment = Assignment::Assign {
            session,
            user,
            at: self.updated_at,
        };
        self
    }

    pub fn clear_assignment(mut self) -> Self {
        self.assignment = Assignment::Clear;
        self
    }

    pub fn verification(mut self, verification: Verification) -> Self {
        self.verification = Some(verification);
        self
    }

    pub fn notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }

    pub fn edits(mut self, by: UserId, changes: Vec<FieldChange>) -> Self {
        if !changes.is_empty() {
            self.edits = Some(EditBatch { by, changes });
        }
        self
    }

    pub fn bump_retry(mut self) -> Self {
        self.retry_increment += 1;
        self
    }

    pub fn bump_timeout(mut self) -> Self {
        self.timeout_increment += 1;
        self
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Task table contract.
pub trait TaskStore: Send + Sync + 'static {
    /// Insert a new task unless one with the same `source_ref` exists.
    /// Returns `true` only when this call created the row.
    fn insert_if_absent(&self, task: &Task) -> impl Future<Output = Result<bool>> + Send;

    fn get_task(&self, id: TaskId) -> impl Future<Output = Result<Option<Task>>> + Send;

    /// Pending tasks, oldest first by `(created_at, id)`.
    fn pending_tasks(&self, limit: usize) -> impl Future<Output = Result<Vec<Task>>> + Send;

    /// In-progress tasks claimed by `session`, oldest claim first.
    fn claims_held_by(
        &self,
        session: SessionId,
    ) -> impl Future<Output = Result<Vec<Task>>> + Send;

    /// In-progress tasks claimed strictly before `cutoff`, oldest claim first.
    fn stale_claims(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Task>>> + Send;

    /// Apply `patch` iff `guard` holds at write time. Returns the updated task,
    /// or `None` when the predicate failed (or the task does not exist).
    fn conditional_update(
        &self,
        id: TaskId,
        guard: &Guard,
        patch: &TaskPatch,
    ) -> impl Future<Output = Result<Option<Task>>> + Send;

    /// Edit rows for a task, ordered by field name.
    fn task_edits(&self, id: TaskId) -> impl Future<Output = Result<Vec<Edit>>> + Send;

    /// Tasks filtered by status, newest first.
    fn list_tasks(
        &self,
        status: Option<Status>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Task>>> + Send;

    /// Aggregate counts; "today" starts at `day_start`.
    fn stats(
        &self,
        user: UserId,
        day_start: DateTime<Utc>,
    ) -> impl Future<Output = Result<TaskStats>> + Send;
}

/// Users and sessions.
pub trait SessionStore: Send + Sync + 'static {
    fn insert_user(&self, user: &User) -> impl Future<Output = Result<()>> + Send;

    fn get_user(&self, id: UserId) -> impl Future<Output = Result<Option<User>>> + Send;

    fn insert_session(&self, session: &Session) -> impl Future<Output = Result<()>> + Send;

    fn get_session(&self, id: SessionId) -> impl Future<Output = Result<Option<Session>>> + Send;

    fn session_by_token(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Option<Session>>> + Send;

    /// Slide an active session's expiry. Returns `false` if it is no longer active.
    fn touch_session(
        &self,
        id: SessionId,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Mark a session inactive. Returns `true` if this call deactivated it.
    fn deactivate_session(
        &self,
        id: SessionId,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool>> + Send;
}

/// Everything the engine needs from storage.
pub trait Store: TaskStore + SessionStore {}

impl<T: TaskStore + SessionStore> Store for T {}
