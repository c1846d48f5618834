//! Task manager: claim, edit, submit and release.
//!
//! Every mutation is a single conditional update against the store. When the
//! guard fails the task is re-read to tell the caller why (someone else owns
//! it, it moved on, or it is gone).

use chrono::{DateTime, NaiveTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::clock::Clock;
use crate::config::ClaimConfig;
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::{
    Edit, FieldChange, ReviewAction, SessionId, Status, Task, TaskId, TaskStats, UserId,
};
use crate::store::{Guard, Store, TaskPatch, Verification};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, record_task, start_task_span};
use opentelemetry::KeyValue;

/// Pending tasks read per candidate batch in `claim_next`.
const CLAIM_CANDIDATES: usize = 8;

/// Release reasons carried on `released` events.
pub mod reason {
    pub const VOLUNTARY: &str = "voluntary";
    pub const NEEDS_REVISION: &str = "needs_revision";
    pub const LOGOUT: &str = "logout";
    pub const SESSION_EXPIRED: &str = "session_expired";
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Task),
    NoTaskAvailable,
}

impl ClaimOutcome {
    pub fn task(&self) -> Option<&Task> {
        match self {
            ClaimOutcome::Claimed(task) => Some(task),
            ClaimOutcome::NoTaskAvailable => None,
        }
    }

    pub fn into_task(self) -> Option<Task> {
        match self {
            ClaimOutcome::Claimed(task) => Some(task),
            ClaimOutcome::NoTaskAvailable => None,
        }
    }
}

pub struct TaskManager<S> {
    store: Arc<S>,
    events: Arc<Broadcaster>,
    clock: Arc<dyn Clock>,
    config: ClaimConfig,
}

impl<S> Clone for TaskManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
        }
    }
}

impl<S: Store> TaskManager<S> {
    pub fn new(
        store: Arc<S>,
        events: Arc<Broadcaster>,
        clock: Arc<dyn Clock>,
        config: ClaimConfig,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            config,
        }
    }

    /// Claim the oldest pending task for `session`.
    ///
    /// A session holds at most one claim: if it already has one, that task
    /// is returned unchanged.
    pub async fn claim_next(&self, user: UserId, session: SessionId) -> Result<ClaimOutcome> {
        let span = start_task_span("claim", None);
        async {
            if let Some(held) = self.held(session).await? {
                record_task(&span, held.id);
                return Ok(ClaimOutcome::Claimed(held));
            }

            let mut lost = 0u32;
            loop {
                let candidates = self.store.pending_tasks(CLAIM_CANDIDATES).await?;
                if candidates.is_empty() {
                    metrics::claims().add(1, &[KeyValue::new("result", "empty")]);
                    return Ok(ClaimOutcome::NoTaskAvailable);
                }

                for candidate in candidates {
                    let patch = TaskPatch::at(self.clock.now())
                        .status(Status::InProgress)
                        .assign(session, user);
                    let guard = Guard::claimable_by(session);
                    match self
                        .store
                        .conditional_update(candidate.id, &guard, &patch)
                        .await?
                    {
                        Some(task) => {
                            record_task(&span, task.id);
                            record_state_transition(&span, Status::Pending, Status::InProgress);
                            metrics::claims().add(1, &[KeyValue::new("result", "claimed")]);
                            self.events.broadcast(EventKind::Claimed {
                                task_id: task.id,
                                user_id: user,
                                session_id: session,
                            });
                            info!(task_id = %task.id, user_id = %user, "task claimed");
                            return Ok(ClaimOutcome::Claimed(task));
                        }
                        None => {
                            // A concurrent call on the same session may have won.
                            if let Some(held) = self.held(session).await? {
                                record_task(&span, held.id);
                                return Ok(ClaimOutcome::Claimed(held));
                            }
                            lost += 1;
                            metrics::lost_races().add(1, &[KeyValue::new("operation", "claim")]);
                            debug!(task_id = %candidate.id, lost, "claim lost race");
                            if lost >= self.config.claim_attempts {
                                warn!(attempts = lost, "giving up claim after repeated contention");
                                metrics::claims()
                                    .add(1, &[KeyValue::new("result", "contention")]);
                                return Err(Error::ClaimContention { attempts: lost });
                            }
                        }
                    }
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    /// Set one field of the working copy.
    pub async fn edit_field(
        &self,
        task_id: TaskId,
        session: SessionId,
        field: &str,
        value: Value,
        reason: Option<String>,
    ) -> Result<Task> {
        let span = start_task_span("edit", Some(task_id));
        async {
            if field.trim().is_empty() {
                return Err(Error::Validation("field name must not be empty".to_string()));
            }
            let task = self.owned(task_id, session, "edit").await?;
            let by = editor(&task, session)?;

            let mut change = FieldChange::new(field, value);
            change.reason = reason;
            let patch = TaskPatch::at(self.clock.now()).edits(by, vec![change]);

            match self
                .store
                .conditional_update(task_id, &Guard::claimed_by(session), &patch)
                .await?
            {
                Some(task) => {
                    debug!(field, edit_count = task.edit_count, "field edited");
                    Ok(task)
                }
                None => Err(self.explain_miss(task_id, session, "edit").await),
            }
        }
        .instrument(span)
        .await
    }

    /// Finalize or send back the claimed task.
    pub async fn submit(
        &self,
        task_id: TaskId,
        session: SessionId,
        action: ReviewAction,
        changes: Vec<FieldChange>,
        notes: Option<String>,
    ) -> Result<Task> {
        let span = start_task_span("submit", Some(task_id));
        async {
            if let Some(change) = changes.iter().find(|c| c.field.trim().is_empty()) {
                return Err(Error::Validation(format!(
                    "field name must not be empty (value {})",
                    change.value
                )));
            }
            let task = self.owned(task_id, session, "submit").await?;
            let by = editor(&task, session)?;
            let now = self.clock.now();

            let base = TaskPatch::at(now)
                .edits(by, changes)
                .notes(notes)
                .clear_assignment();
            let patch = match action {
                ReviewAction::Approved | ReviewAction::ApprovedWithChanges => base
                    .status(Status::Verified)
                    .verification(Verification {
                        is_verified: true,
                        by,
                        at: now,
                    }),
                ReviewAction::Rejected => base.status(Status::Rejected).verification(Verification {
                    is_verified: false,
                    by,
                    at: now,
                }),
                ReviewAction::NeedsRevision => base.status(Status::Pending).bump_retry(),
            };

            let Some(updated) = self
                .store
                .conditional_update(task_id, &Guard::claimed_by(session), &patch)
                .await?
            else {
                return Err(self.explain_miss(task_id, session, "submit").await);
            };

            record_state_transition(&span, Status::InProgress, updated.status);
            match action {
                ReviewAction::NeedsRevision => {
                    self.events.broadcast(EventKind::Released {
                        task_id,
                        reason: reason::NEEDS_REVISION.to_string(),
                    });
                }
                _ => {
                    self.events.broadcast(EventKind::Verified {
                        task_id,
                        status: updated.status,
                        verified_by: by,
                        has_edits: updated.has_edits,
                    });
                }
            }
            info!(
                action = action.as_str(),
                status = updated.status.as_str(),
                edit_count = updated.edit_count,
                "task submitted"
            );
            Ok(updated)
        }
        .instrument(span.clone())
        .await
    }

    /// Voluntarily hand a claimed task back to the pool. Counters are untouched.
    pub async fn release(&self, task_id: TaskId, session: SessionId, reason: &str) -> Result<Task> {
        let span = start_task_span("release", Some(task_id));
        async {
            self.owned(task_id, session, "release").await?;
            let patch = TaskPatch::at(self.clock.now())
                .status(Status::Pending)
                .clear_assignment();
            let Some(task) = self
                .store
                .conditional_update(task_id, &Guard::claimed_by(session), &patch)
                .await?
            else {
                return Err(self.explain_miss(task_id, session, "release").await);
            };

            record_state_transition(&span, Status::InProgress, Status::Pending);
            self.events.broadcast(EventKind::Released {
                task_id,
                reason: reason.to_string(),
            });
            info!(reason, "task released");
            Ok(task)
        }
        .instrument(span.clone())
        .await
    }

    /// Release everything `session` holds. Used when a session ends; losing a
    /// task to a concurrent submit or reclaim is not an error here.
    pub async fn release_held_by(&self, session: SessionId, reason: &str) -> Result<Vec<Task>> {
        let mut released = Vec::new();
        for held in self.store.claims_held_by(session).await? {
            match self.release(held.id, session, reason).await {
                Ok(task) => released.push(task),
                Err(e) if e.is_conflict() || matches!(e, Error::NotFound(_)) => {
                    debug!(task_id = %held.id, error = %e, "held task moved on before release");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(released)
    }

    /// Counts as of now. "Today" is the current UTC calendar day.
    pub async fn stats(&self, user: UserId) -> Result<TaskStats> {
        self.store.stats(user, day_start(self.clock.now())).await
    }

    pub async fn get(&self, task_id: TaskId) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(Error::NotFound(task_id))
    }

    pub async fn edits(&self, task_id: TaskId) -> Result<Vec<Edit>> {
        self.store.task_edits(task_id).await
    }

    pub async fn list(&self, status: Option<Status>, limit: usize) -> Result<Vec<Task>> {
        self.store.list_tasks(status, limit).await
    }

    /// The claim `session` already holds, oldest first if it somehow has more.
    async fn held(&self, session: SessionId) -> Result<Option<Task>> {
        let held = self.store.claims_held_by(session).await?.into_iter().next();
        if let Some(task) = &held {
            debug!(task_id = %task.id, "session already holds a claim");
            metrics::claims().add(1, &[KeyValue::new("result", "resumed")]);
        }
        Ok(held)
    }

    /// Read the task and check it is in progress and held by `session`.
    /// State is checked before ownership.
    async fn owned(&self, task_id: TaskId, session: SessionId, operation: &'static str) -> Result<Task> {
        let task = self.get(task_id).await?;
        check_owned(&task, session, operation)?;
        Ok(task)
    }

    /// A guarded write missed: re-read and report why.
    async fn explain_miss(&self, task_id: TaskId, session: SessionId, operation: &'static str) -> Error {
        metrics::lost_races().add(1, &[KeyValue::new("operation", operation)]);
        match self.store.get_task(task_id).await {
            Ok(None) => Error::NotFound(task_id),
            Ok(Some(task)) => match check_owned(&task, session, operation) {
                Err(e) => e,
                Ok(()) => Error::Other(format!("conditional {operation} of task {task_id} was rejected")),
            },
            Err(e) => e,
        }
    }
}

fn check_owned(task: &Task, session: SessionId, operation: &'static str) -> Result<()> {
    if task.status != Status::InProgress {
        return Err(Error::InvalidState {
            task: task.id,
            status: task.status,
            operation,
        });
    }
    if !task.is_claimed_by(session) {
        return Err(Error::NotOwner {
            task: task.id,
            session,
        });
    }
    Ok(())
}

fn editor(task: &Task, session: SessionId) -> Result<UserId> {
    task.assigned_user.ok_or(Error::NotOwner {
        task: task.id,
        session,
    })
}

fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}
