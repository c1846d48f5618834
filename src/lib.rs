//! # reviewq
//!
//! Coordination engine for human verification of machine-produced records.
//!
//! Upstream items become review tasks; verifiers claim them one at a time,
//! edit fields, and approve, reject or send them back. Stale claims are
//! reclaimed on a timer, and every transition is pushed to live observers.
//! Storage is Postgres (sqlx) or an in-process store.

pub mod api;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod store;
pub mod telemetry;
