//! HTTP surface: task routes for verifiers and the observer WebSocket.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod ws;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::engine::Engine;
use crate::store::Store;

pub struct AppState<S> {
    pub engine: Engine<S>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<S> AppState<S> {
    pub fn new(engine: Engine<S>) -> Self {
        Self { engine }
    }
}

pub fn create_routes<S: Store>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::<S>))
        .route("/api/tasks/claim", post(handlers::claim::<S>))
        .route("/api/tasks/{id}", get(handlers::get_task::<S>))
        .route("/api/tasks/{id}/edit", post(handlers::edit_field::<S>))
        .route("/api/tasks/{id}/submit", post(handlers::submit::<S>))
        .route("/api/tasks/{id}/release", post(handlers::release::<S>))
        .route("/api/stats", get(handlers::stats::<S>))
        .route("/api/sessions/logout", post(handlers::logout::<S>))
        .route("/ws", get(ws::observe::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
