//! Task table operations.
//!
//! Conditional updates lock the row with a guarded `SELECT … FOR UPDATE`,
//! so the guard is evaluated against the committed row at write time. Edit
//! upserts and the column update run in the same transaction.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use super::Db;
use crate::error::{Error, Result};
use crate::model::{Edit, FieldMap, SessionId, Status, Task, TaskId, TaskStats, UserId};
use crate::store::{Assignment, Guard, TaskPatch, TaskStore};

const TASK_COLUMNS: &str = "id, source_ref, original_data, current_data, has_edits, edit_count, status, \
     assigned_session, assigned_user, assigned_at, is_verified, verified_by, verified_at, \
     verification_notes, retry_count, timeout_count, created_at, updated_at";

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl TaskStore for Db {
    async fn insert_if_absent(&self, task: &Task) -> Result<bool> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO tasks (id, source_ref, original_data, current_data, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (source_ref) DO NOTHING
             RETURNING id",
        )
        .bind(task.id.0)
        .bind(&task.source_ref)
        .bind(Json(&task.original_data))
        .bind(Json(&task.current_data))
        .bind(task.status.as_str())
        .bind(task.created_at)
        .bind(task.updated_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(inserted.is_some())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TaskRow::try_into_task).transpose()
    }

    async fn pending_tasks(&self, n: usize) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending'
             ORDER BY created_at, id LIMIT $1"
        ))
        .bind(limit(n))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn claims_held_by(&self, session: SessionId) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status = 'in_progress' AND assigned_session = $1
             ORDER BY assigned_at, id"
        ))
        .bind(session.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn stale_claims(&self, cutoff: DateTime<Utc>, n: usize) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status = 'in_progress' AND assigned_at < $1
             ORDER BY assigned_at, id LIMIT $2"
        ))
        .bind(cutoff)
        .bind(limit(n))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn conditional_update(
        &self,
        id: TaskId,
        guard: &Guard,
        patch: &TaskPatch,
    ) -> Result<Option<Task>> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM tasks
             WHERE id = $1 AND status = $2
               AND ($3::uuid IS NULL OR assigned_session = $3)
               AND ($4::timestamptz IS NULL OR assigned_at = $4)
               AND ($5::uuid IS NULL OR NOT EXISTS (
                   SELECT 1 FROM tasks held
                   WHERE held.assigned_session = $5 AND held.status = 'in_progress'))
             FOR UPDATE",
        )
        .bind(id.0)
        .bind(guard.status.as_str())
        .bind(guard.assigned_session.map(|s| s.0))
        .bind(guard.assigned_at)
        .bind(guard.free_session.map(|s| s.0))
        .fetch_optional(&mut *tx)
        .await?;
        if locked.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        if let Some(batch) = &patch.edits {
            for change in &batch.changes {
                sqlx::query(
                    "INSERT INTO task_edits
                         (id, task_id, field_name, original_value, current_value, edited_by, edited_at, edit_reason)
                     SELECT $1, t.id, $3, COALESCE(t.original_data -> $3, 'null'::jsonb), $4, $5, $6, $7
                     FROM tasks t WHERE t.id = $2
                     ON CONFLICT (task_id, field_name) DO UPDATE SET
                         current_value = EXCLUDED.current_value,
                         edited_by = EXCLUDED.edited_by,
                         edited_at = EXCLUDED.edited_at,
                         edit_reason = COALESCE(EXCLUDED.edit_reason, task_edits.edit_reason)",
                )
                .bind(Uuid::new_v4())
                .bind(id.0)
                .bind(&change.field)
                .bind(Json(&change.value))
                .bind(batch.by.0)
                .bind(patch.updated_at)
                .bind(&change.reason)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE tasks SET current_data = current_data || jsonb_build_object($2::text, $3::jsonb)
                     WHERE id = $1",
                )
                .bind(id.0)
                .bind(&change.field)
                .bind(Json(&change.value))
                .execute(&mut *tx)
                .await?;
            }
        }

        let (mode, session, user, at) = match patch.assignment {
            Assignment::Keep => ("keep", None, None, None),
            Assignment::Assign { session, user, at } => {
                ("assign", Some(session.0), Some(user.0), Some(at))
            }
            Assignment::Clear => ("clear", None, None, None),
        };
        let verification = patch.verification.as_ref();

        // tasks_one_claim_per_session catches a concurrent claim by the same
        // session that passed the NOT EXISTS check above.
        let updated: std::result::Result<TaskRow, sqlx::Error> = sqlx::query_as(&format!(
            "UPDATE tasks SET
                 status = COALESCE($2, status),
                 assigned_session = CASE $3 WHEN 'keep' THEN assigned_session ELSE $4::uuid END,
                 assigned_user = CASE $3 WHEN 'keep' THEN assigned_user ELSE $5::uuid END,
                 assigned_at = CASE $3 WHEN 'keep' THEN assigned_at ELSE $6::timestamptz END,
                 is_verified = COALESCE($7, is_verified),
                 verified_by = COALESCE($8, verified_by),
                 verified_at = COALESCE($9, verified_at),
                 verification_notes = COALESCE($10, verification_notes),
                 retry_count = retry_count + $11,
                 timeout_count = timeout_count + $12,
                 edit_count = (SELECT count(*)::int FROM task_edits WHERE task_id = $1),
                 has_edits = EXISTS (SELECT 1 FROM task_edits WHERE task_id = $1),
                 updated_at = $13
             WHERE id = $1
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id.0)
        .bind(patch.status.map(Status::as_str))
        .bind(mode)
        .bind(session)
        .bind(user)
        .bind(at)
        .bind(verification.map(|v| v.is_verified))
        .bind(verification.map(|v| v.by.0))
        .bind(verification.map(|v| v.at))
        .bind(&patch.notes)
        .bind(i32::try_from(patch.retry_increment).unwrap_or(i32::MAX))
        .bind(i32::try_from(patch.timeout_increment).unwrap_or(i32::MAX))
        .bind(patch.updated_at)
        .fetch_one(&mut *tx)
        .await;
        let row = match updated {
            Ok(row) => row,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                tx.rollback().await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        tx.commit().await?;
        row.try_into_task().map(Some)
    }

    async fn task_edits(&self, id: TaskId) -> Result<Vec<Edit>> {
        let rows: Vec<EditRow> = sqlx::query_as(
            "SELECT id, task_id, field_name, original_value, current_value, edited_by, edited_at, edit_reason
             FROM task_edits WHERE task_id = $1 ORDER BY field_name",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EditRow::into_edit).collect())
    }

    async fn list_tasks(&self, status: Option<Status>, n: usize) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY created_at DESC, id DESC LIMIT $2"
        ))
        .bind(status.map(Status::as_str))
        .bind(limit(n))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn stats(&self, user: UserId, day_start: DateTime<Utc>) -> Result<TaskStats> {
        let row: StatsRow = sqlx::query_as(
            "SELECT
                 count(*) FILTER (WHERE status = 'pending') AS pending,
                 count(*) FILTER (WHERE status = 'in_progress') AS in_progress,
                 count(*) FILTER (WHERE status = 'verified') AS verified_total,
                 count(*) FILTER (WHERE status = 'verified' AND verified_at >= $2) AS verified_today,
                 count(*) FILTER (WHERE status = 'verified' AND has_edits) AS approved_with_changes_total,
                 count(*) FILTER (WHERE status = 'rejected') AS rejected_total,
                 count(*) FILTER (WHERE status = 'rejected' AND verified_at >= $2) AS rejected_today,
                 count(*) FILTER (WHERE status = 'dead_letter') AS dead_letter,
                 count(*) FILTER (WHERE status = 'in_progress' AND assigned_user = $1) AS mine_in_progress,
                 count(*) FILTER (WHERE status IN ('verified', 'rejected')
                                    AND verified_by = $1 AND verified_at >= $2) AS mine_verified_today
             FROM tasks",
        )
        .bind(user.0)
        .bind(day_start)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    source_ref: String,
    original_data: Json<FieldMap>,
    current_data: Json<FieldMap>,
    has_edits: bool,
    edit_count: i32,
    status: String,
    assigned_session: Option<Uuid>,
    assigned_user: Option<Uuid>,
    assigned_at: Option<DateTime<Utc>>,
    is_verified: Option<bool>,
    verified_by: Option<Uuid>,
    verified_at: Option<DateTime<Utc>>,
    verification_notes: Option<String>,
    retry_count: i32,
    timeout_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn count(name: &str, n: i32) -> Result<u32> {
    u32::try_from(n).map_err(|_| Error::Other(format!("negative {name} in tasks row: {n}")))
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            source_ref: self.source_ref,
            original_data: self.original_data.0,
            current_data: self.current_data.0,
            has_edits: self.has_edits,
            edit_count: count("edit_count", self.edit_count)?,
            status: self.status.parse()?,
            assigned_session: self.assigned_session.map(SessionId),
            assigned_user: self.assigned_user.map(UserId),
            assigned_at: self.assigned_at,
            is_verified: self.is_verified,
            verified_by: self.verified_by.map(UserId),
            verified_at: self.verified_at,
            verification_notes: self.verification_notes,
            retry_count: count("retry_count", self.retry_count)?,
            timeout_count: count("timeout_count", self.timeout_count)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EditRow {
    id: Uuid,
    task_id: Uuid,
    field_name: String,
    original_value: Json<serde_json::Value>,
    current_value: Json<serde_json::Value>,
    edited_by: Uuid,
    edited_at: DateTime<Utc>,
    edit_reason: Option<String>,
}

impl EditRow {
    fn into_edit(self) -> Edit {
        Edit {
            id: self.id,
            task_id: TaskId(self.task_id),
            field_name: self.field_name,
            original_value: self.original_value.0,
            current_value: self.current_value.0,
            edited_by: UserId(self.edited_by),
            edited_at: self.edited_at,
            edit_reason: self.edit_reason,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StatsRow {
    pending: i64,
    in_progress: i64,
    verified_total: i64,
    verified_today: i64,
    approved_with_changes_total: i64,
    rejected_total: i64,
    rejected_today: i64,
    dead_letter: i64,
    mine_in_progress: i64,
    mine_verified_today: i64,
}

impl From<StatsRow> for TaskStats {
    fn from(row: StatsRow) -> Self {
        let n = |v: i64| u64::try_from(v).unwrap_or(0);
        Self {
            pending: n(row.pending),
            in_progress: n(row.in_progress),
            verified_total: n(row.verified_total),
            verified_today: n(row.verified_today),
            approved_with_changes_total: n(row.approved_with_changes_total),
            rejected_total: n(row.rejected_total),
            rejected_today: n(row.rejected_today),
            dead_letter: n(row.dead_letter),
            mine_in_progress: n(row.mine_in_progress),
            mine_verified_today: n(row.mine_verified_today),
        }
    }
}
