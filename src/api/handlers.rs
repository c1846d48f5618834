//! Task, stats and session handlers.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::AppState;
use super::auth::Authenticated;
use super::error::{ApiError, ApiResult};
use crate::engine::ClaimOutcome;
use crate::engine::tasks::reason;
use crate::model::{Edit, FieldChange, ReviewAction, Task, TaskId, TaskStats};
use crate::store::Store;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClaimResponse {
    Claimed { task: Task },
    Empty,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub edits: Vec<Edit>,
}

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub field: String,
    pub value: Value,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub action: ReviewAction,
    #[serde(default)]
    pub changes: Vec<FieldChange>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReleaseRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Parse a JSON body, treating an empty body as the default value.
fn json_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
}

/// Parse a required JSON body.
fn required_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
}

pub async fn health<S: Store>(State(state): State<AppState<S>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "observers": state.engine.events.connection_count(),
    }))
}

pub async fn claim<S: Store>(
    State(state): State<AppState<S>>,
    Authenticated(principal): Authenticated,
) -> ApiResult<Json<ClaimResponse>> {
    let outcome = state
        .engine
        .tasks
        .claim_next(principal.user_id(), principal.session_id())
        .await?;
    Ok(Json(match outcome {
        ClaimOutcome::Claimed(task) => ClaimResponse::Claimed { task },
        ClaimOutcome::NoTaskAvailable => ClaimResponse::Empty,
    }))
}

pub async fn get_task<S: Store>(
    State(state): State<AppState<S>>,
    Authenticated(_): Authenticated,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<TaskDetail>> {
    let task = state.engine.tasks.get(id).await?;
    let edits = state.engine.tasks.edits(id).await?;
    Ok(Json(TaskDetail { task, edits }))
}

pub async fn edit_field<S: Store>(
    State(state): State<AppState<S>>,
    Authenticated(principal): Authenticated,
    Path(id): Path<TaskId>,
    body: Bytes,
) -> ApiResult<Json<Task>> {
    let req: EditRequest = required_body(&body)?;
    let task = state
        .engine
        .tasks
        .edit_field(id, principal.session_id(), &req.field, req.value, req.reason)
        .await?;
    Ok(Json(task))
}

pub async fn submit<S: Store>(
    State(state): State<AppState<S>>,
    Authenticated(principal): Authenticated,
    Path(id): Path<TaskId>,
    body: Bytes,
) -> ApiResult<Json<Task>> {
    let req: SubmitRequest = required_body(&body)?;
    let task = state
        .engine
        .tasks
        .submit(id, principal.session_id(), req.action, req.changes, req.notes)
        .await?;
    Ok(Json(task))
}

pub async fn release<S: Store>(
    State(state): State<AppState<S>>,
    Authenticated(principal): Authenticated,
    Path(id): Path<TaskId>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let req: ReleaseRequest = json_body(&body)?;
    let why = req.reason.as_deref().unwrap_or(reason::VOLUNTARY);
    state
        .engine
        .tasks
        .release(id, principal.session_id(), why)
        .await?;
    Ok(Json(json!({ "released": true })))
}

pub async fn stats<S: Store>(
    State(state): State<AppState<S>>,
    Authenticated(principal): Authenticated,
) -> ApiResult<Json<TaskStats>> {
    Ok(Json(state.engine.tasks.stats(principal.user_id()).await?))
}

pub async fn logout<S: Store>(
    State(state): State<AppState<S>>,
    Authenticated(principal): Authenticated,
) -> ApiResult<Json<Value>> {
    state.engine.sessions.logout(principal.session_id()).await?;
    Ok(Json(json!({ "logged_out": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_release_body_uses_default() {
        let req: ReleaseRequest = json_body(&Bytes::from_static(b"")).unwrap();
        assert!(req.reason.is_none());
        let req: ReleaseRequest = json_body(&Bytes::from_static(br#"{"reason":"lunch"}"#)).unwrap();
        assert_eq!(req.reason.as_deref(), Some("lunch"));
    }

    #[test]
    fn claim_response_is_tagged_by_status() {
        let empty = serde_json::to_value(ClaimResponse::Empty).unwrap();
        assert_eq!(empty, json!({"status": "empty"}));
    }
}
