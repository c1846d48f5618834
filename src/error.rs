//! Error types for reviewq.

use thiserror::Error;

use crate::model::{SessionId, Status, TaskId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The caller's session is not the one holding the claim.
    #[error("task {task} is not claimed by this session")]
    NotOwner { task: TaskId, session: SessionId },

    #[error("cannot {operation} task {task} in state {status}")]
    InvalidState {
        task: TaskId,
        status: Status,
        operation: &'static str,
    },

    #[error("session is invalid")]
    SessionInvalid,

    #[error("session has expired")]
    SessionExpired,

    /// Every candidate was taken by another caller before ours landed.
    #[error("claim lost to concurrent callers {attempts} times")]
    ClaimContention { attempts: u32 },

    #[error("task {task} exceeded its retry budget ({retry_count} retries)")]
    RetryBudgetExceeded { task: TaskId, retry_count: u32 },

    #[error("store unavailable: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the failure came from the storage layer and may succeed on retry.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::Database(_) | Error::StoreUnavailable(_))
    }

    /// Whether the caller lost a race with another action and should refresh.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::NotOwner { .. } | Error::InvalidState { .. } | Error::ClaimContention { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
