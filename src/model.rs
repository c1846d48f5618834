//! Core data model.
//!
//! A task is one reviewable record pulled from the upstream feed. It carries
//! an immutable snapshot of the machine-generated fields, a working copy the
//! verifier edits, and the claim/verification bookkeeping that the engine
//! drives through its lifecycle.

pub mod session;
pub mod task;

pub use session::{Principal, Session, SessionId, User, UserId};
pub use task::{
    Edit, FieldChange, FieldMap, ReviewAction, Status, Task, TaskId, TaskStats,
};
