//! In-process store.
//!
//! All tables live behind one mutex, so every method is atomic. Used by the
//! test suite and by `reviewq serve` when no `DATABASE_URL` is configured.
//! It can also be told to fail, to exercise the engine's error paths.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{Assignment, Guard, SessionStore, TaskPatch, TaskStore};
use crate::error::{Error, Result};
use crate::model::{Edit, Session, SessionId, Status, Task, TaskId, TaskStats, User, UserId};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Tables>>,
}

#[derive(Debug, Default)]
struct Tables {
    tasks: HashMap<TaskId, Task>,
    by_source: HashMap<String, TaskId>,
    edits: HashMap<TaskId, Vec<Edit>>,
    users: HashMap<UserId, User>,
    sessions: HashMap<SessionId, Session>,
    tokens: HashMap<String, SessionId>,
    unavailable: bool,
    failing_tasks: HashSet<TaskId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`Error::StoreUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut tables) = self.inner.lock() {
            tables.unavailable = unavailable;
        }
    }

    /// Make conditional updates of one task fail.
    pub fn fail_updates_for(&self, id: TaskId) {
        if let Ok(mut tables) = self.inner.lock() {
            tables.failing_tasks.insert(id);
        }
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        let tables = self
            .inner
            .lock()
            .map_err(|e| Error::StoreUnavailable(format!("memory store poisoned: {e}")))?;
        if tables.unavailable {
            return Err(Error::StoreUnavailable("memory store offline".to_string()));
        }
        Ok(tables)
    }
}

/// Apply `patch` to a task and its edit rows in place.
fn apply_patch(task: &mut Task, edits: &mut Vec<Edit>, patch: &TaskPatch) {
    if let Some(batch) = &patch.edits {
        for change in &batch.changes {
            task.current_data
                .insert(change.field.clone(), change.value.clone());
            match edits.iter_mut().find(|e| e.field_name == change.field) {
                Some(edit) => {
                    edit.current_value = change.value.clone();
                    edit.edited_by = batch.by;
                    edit.edited_at = patch.updated_at;
                    if change.reason.is_some() {
                        edit.edit_reason = change.reason.clone();
                    }
                }
                None => edits.push(Edit {
                    id: Uuid::new_v4(),
                    task_id: task.id,
                    field_name: change.field.clone(),
                    original_value: task
                        .original_data
                        .get(&change.field)
                        .cloned()
                        .unwrap_or(Value::Null),
                    current_value: change.value.clone(),
                    edited_by: batch.by,
                    edited_at: patch.updated_at,
                    edit_reason: change.reason.clone(),
                }),
            }
        }
        task.edit_count = u32::try_from(edits.len()).unwrap_or(u32::MAX);
        task.has_edits = task.edit_count > 0;
    }

    if let Some(status) = patch.status {
        task.status = status;
    }
    match patch.assignment {
        Assignment::Keep => {}
        Assignment::Assign { session, user, at } => {
            task.assigned_session = Some(session);
            task.assigned_user = Some(user);
            task.assigned_at = Some(at);
        }
        Assignment::Clear => {
            task.assigned_session = None;
            task.assigned_user = None;
            task.assigned_at = None;
        }
    }
    if let Some(v) = &patch.verification {
        task.is_verified = Some(v.is_verified);
        task.verified_by = Some(v.by);
        task.verified_at = Some(v.at);
    }
    if let Some(notes) = &patch.notes {
        task.verification_notes = Some(notes.clone());
    }
    task.retry_count += patch.retry_increment;
    task.timeout_count += patch.timeout_increment;
    task.updated_at = patch.updated_at;
}

impl TaskStore for MemoryStore {
    async fn insert_if_absent(&self, task: &Task) -> Result<bool> {
        let mut tables = self.tables()?;
        if tables.by_source.contains_key(&task.source_ref) || tables.tasks.contains_key(&task.id)
        {
            return Ok(false);
        }
        tables.by_source.insert(task.source_ref.clone(), task.id);
        tables.tasks.insert(task.id, task.clone());
        Ok(true)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.tables()?.tasks.get(&id).cloned())
    }

    async fn pending_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        let tables = self.tables()?;
        let mut pending: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| t.status == Status::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(Task::queue_position);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn claims_held_by(&self, session: SessionId) -> Result<Vec<Task>> {
        let tables = self.tables()?;
        let mut held: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| t.is_claimed_by(session))
            .cloned()
            .collect();
        held.sort_by_key(|t| (t.assigned_at, t.id));
        Ok(held)
    }

    async fn stale_claims(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let tables = self.tables()?;
        let mut stale: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| t.status == Status::InProgress && t.assigned_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect();
        stale.sort_by_key(|t| (t.assigned_at, t.id));
        stale.truncate(limit);
        Ok(stale)
    }

    async fn conditional_update(
        &self,
        id: TaskId,
        guard: &Guard,
        patch: &TaskPatch,
    ) -> Result<Option<Task>> {
        let mut tables = self.tables()?;
        if tables.failing_tasks.contains(&id) {
            return Err(Error::StoreUnavailable(format!("write to task {id} failed")));
        }
        let Tables { tasks, edits, .. } = &mut *tables;
        let Some(task) = tasks.get(&id) else {
            return Ok(None);
        };
        if !guard.matches(task) {
            return Ok(None);
        }
        if let Some(session) = guard.free_session {
            if tasks.values().any(|t| t.is_claimed_by(session)) {
                return Ok(None);
            }
        }
        let Some(task) = tasks.get_mut(&id) else {
            return Ok(None);
        };
        apply_patch(task, edits.entry(id).or_default(), patch);
        Ok(Some(task.clone()))
    }

    async fn task_edits(&self, id: TaskId) -> Result<Vec<Edit>> {
        let mut edits = self.tables()?.edits.get(&id).cloned().unwrap_or_default();
        edits.sort_by(|a, b| a.field_name.cmp(&b.field_name));
        Ok(edits)
    }

    async fn list_tasks(&self, status: Option<Status>, limit: usize) -> Result<Vec<Task>> {
        let tables = self.tables()?;
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| std::cmp::Reverse(t.queue_position()));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn stats(&self, user: UserId, day_start: DateTime<Utc>) -> Result<TaskStats> {
        let tables = self.tables()?;
        let mut stats = TaskStats::default();
        for task in tables.tasks.values() {
            let today = task.verified_at.is_some_and(|at| at >= day_start);
            match task.status {
                Status::Pending => stats.pending += 1,
                Status::InProgress => {
                    stats.in_progress += 1;
                    if task.assigned_user == Some(user) {
                        stats.mine_in_progress += 1;
                    }
                }
                Status::Verified => {
                    stats.verified_total += 1;
                    if today {
                        stats.verified_today += 1;
                    }
                    if task.has_edits {
                        stats.approved_with_changes_total += 1;
                    }
                }
                Status::Rejected => {
                    stats.rejected_total += 1;
                    if today {
                        stats.rejected_today += 1;
                    }
                }
                Status::DeadLetter => stats.dead_letter += 1,
            }
            if today && task.status.is_terminal() && task.verified_by == Some(user) {
                stats.mine_verified_today += 1;
            }
        }
        Ok(stats)
    }
}

impl SessionStore for MemoryStore {
    async fn insert_user(&self, user: &User) -> Result<()> {
        let mut tables = self.tables()?;
        if tables.users.values().any(|u| u.email == user.email) {
            return Err(Error::Validation(format!("email {} already registered", user.email)));
        }
        tables.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.tables()?.users.get(&id).cloned())
    }

    async fn insert_session(&self, session: &Session) -> Result<()> {
        let mut tables = self.tables()?;
        if tables.tokens.contains_key(&session.token) {
            return Err(Error::Validation("session token already in use".to_string()));
        }
        tables.tokens.insert(session.token.clone(), session.id);
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        Ok(self.tables()?.sessions.get(&id).cloned())
    }

    async fn session_by_token(&self, token: &str) -> Result<Option<Session>> {
        let tables = self.tables()?;
        Ok(tables
            .tokens
            .get(token)
            .and_then(|id| tables.sessions.get(id))
            .cloned())
    }

    async fn touch_session(
        &self,
        id: SessionId,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables()?;
        match tables.sessions.get_mut(&id) {
            Some(session) if session.is_active => {
                session.last_activity = last_activity;
                session.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deactivate_session(&self, id: SessionId, _at: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables()?;
        match tables.sessions.get_mut(&id) {
            Some(session) if session.is_active => {
                session.is_active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldChange, FieldMap};
    use serde_json::json;

    fn task_with(field: &str, value: Value) -> Task {
        let mut data = FieldMap::new();
        data.insert(field.to_string(), value);
        Task::new_pending(format!("item-{}", Uuid::new_v4()), data, Utc::now())
    }

    #[tokio::test]
    async fn insert_if_absent_dedups_on_source_ref() {
        let store = MemoryStore::new();
        let first = task_with("a", json!(1));
        let mut second = task_with("a", json!(2));
        second.source_ref = first.source_ref.clone();

        assert!(store.insert_if_absent(&first).await.unwrap());
        assert!(!store.insert_if_absent(&second).await.unwrap());
        assert_eq!(store.list_tasks(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conditional_update_rejects_failed_guard() {
        let store = MemoryStore::new();
        let task = task_with("a", json!(1));
        store.insert_if_absent(&task).await.unwrap();

        let patch = TaskPatch::at(Utc::now()).status(Status::Verified);
        let result = store
            .conditional_update(task.id, &Guard::status(Status::InProgress), &patch)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(
            store.get_task(task.id).await.unwrap().unwrap().status,
            Status::Pending
        );
    }

    #[tokio::test]
    async fn repeat_edit_keeps_original_value() {
        let store = MemoryStore::new();
        let task = task_with("category", json!("Other"));
        store.insert_if_absent(&task).await.unwrap();
        let user = UserId::new();

        for value in ["M&A", "IPO"] {
            let patch = TaskPatch::at(Utc::now())
                .edits(user, vec![FieldChange::new("category", value)]);
            store
                .conditional_update(task.id, &Guard::status(Status::Pending), &patch)
                .await
                .unwrap()
                .unwrap();
        }

        let edits = store.task_edits(task.id).await.unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].original_value, json!("Other"));
        assert_eq!(edits[0].current_value, json!("IPO"));
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.edit_count, 1);
        assert_eq!(stored.current_data["category"], json!("IPO"));
        assert_eq!(stored.original_data["category"], json!("Other"));
    }

    #[tokio::test]
    async fn session_cannot_take_a_second_claim() {
        let store = MemoryStore::new();
        let first = task_with("a", json!(1));
        let second = task_with("a", json!(2));
        store.insert_if_absent(&first).await.unwrap();
        store.insert_if_absent(&second).await.unwrap();
        let session = SessionId::new();
        let claim = TaskPatch::at(Utc::now())
            .status(Status::InProgress)
            .assign(session, UserId::new());

        let guard = Guard::claimable_by(session);
        assert!(store.conditional_update(first.id, &guard, &claim).await.unwrap().is_some());
        assert!(store.conditional_update(second.id, &guard, &claim).await.unwrap().is_none());
        assert_eq!(store.claims_held_by(session).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_user(&User::new("ada@example.com", "Ada", now)).await.unwrap();
        let err = store
            .insert_user(&User::new("ada@example.com", "Other Ada", now))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.pending_tasks(1).await.unwrap_err();
        assert!(err.is_store_unavailable());
    }
}
