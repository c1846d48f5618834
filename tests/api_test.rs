//! HTTP routes exercised through the router against the in-memory store.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

use reviewq::api::{AppState, create_routes};
use reviewq::config::IngestConfig;
use reviewq::engine::{ChannelFeed, ClientInfo, Engine, EngineSettings};
use reviewq::model::{FieldMap, TaskId};
use reviewq::store::MemoryStore;

struct Harness {
    engine: Engine<MemoryStore>,
    app: Router,
}

fn harness() -> Harness {
    let engine = Engine::new(Arc::new(MemoryStore::new()), EngineSettings::default());
    let app = create_routes(AppState::new(engine.clone()));
    Harness { engine, app }
}

impl Harness {
    async fn token(&self, email: &str) -> String {
        let user = self.engine.sessions.register_user(email, "Verifier").await.unwrap();
        self.engine
            .sessions
            .open_session(user.id, ClientInfo::default())
            .await
            .unwrap()
            .token
    }

    async fn seed(&self, item_id: &str, fields: Value) {
        let (_tx, feed) = ChannelFeed::channel(1);
        let processor = self
            .engine
            .queue_processor(Arc::new(feed), IngestConfig::default());
        let fields: FieldMap = fields.as_object().cloned().unwrap();
        processor.ingest(item_id, fields).await.unwrap();
    }

    async fn call(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let body = match body {
            Some(json) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = self.app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let h = harness();
    let (status, body) = h.call("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "reviewq");
}

#[tokio::test]
async fn requests_without_a_token_are_unauthorized() {
    let h = harness();
    let (status, body) = h.call("POST", "/api/tasks/claim", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "session_invalid");

    let (status, _) = h.call("GET", "/api/stats", Some("bogus"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn claim_edit_submit_flow() {
    let h = harness();
    let token = h.token("ada@example.com").await;

    let (status, body) = h.call("POST", "/api/tasks/claim", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "empty"}));

    h.seed("deal-7", json!({"category": "Other"})).await;
    let (status, body) = h.call("POST", "/api/tasks/claim", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "claimed");
    assert_eq!(body["task"]["status"], "in_progress");
    let id = body["task"]["id"].as_str().unwrap().to_string();

    let (status, body) = h
        .call(
            "POST",
            &format!("/api/tasks/{id}/edit"),
            Some(&token),
            Some(json!({"field": "category", "value": "M&A"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["edit_count"], 1);
    assert_eq!(body["current_data"]["category"], "M&A");

    let (status, body) = h
        .call(
            "POST",
            &format!("/api/tasks/{id}/submit"),
            Some(&token),
            Some(json!({"action": "approved_with_changes", "notes": "fixed category"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "verified");
    assert_eq!(body["is_verified"], true);

    let (status, body) = h.call("GET", &format!("/api/tasks/{id}"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["edits"][0]["original_value"], "Other");
    assert_eq!(body["edits"][0]["current_value"], "M&A");

    let (status, body) = h.call("GET", "/api/stats", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["verified_total"], 1);
    assert_eq!(body["approved_with_changes_total"], 1);
}

#[tokio::test]
async fn other_session_gets_conflict() {
    let h = harness();
    let owner = h.token("owner@example.com").await;
    let other = h.token("other@example.com").await;
    h.seed("item-1", json!({"a": 1})).await;

    let (_, body) = h.call("POST", "/api/tasks/claim", Some(&owner), None).await;
    let id = body["task"]["id"].as_str().unwrap().to_string();

    let (status, body) = h
        .call(
            "POST",
            &format!("/api/tasks/{id}/edit"),
            Some(&other),
            Some(json!({"field": "a", "value": 2})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "not_owner");

    let (status, _) = h.call("POST", &format!("/api/tasks/{id}/release"), Some(&owner), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = h
        .call(
            "POST",
            &format!("/api/tasks/{id}/submit"),
            Some(&owner),
            Some(json!({"action": "approved"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "invalid_state");
}

#[tokio::test]
async fn unknown_task_and_bad_body() {
    let h = harness();
    let token = h.token("ada@example.com").await;

    let missing = TaskId::new();
    let (status, body) = h.call("GET", &format!("/api/tasks/{missing}"), Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, body) = h
        .call(
            "POST",
            &format!("/api/tasks/{missing}/submit"),
            Some(&token),
            Some(json!({"action": "maybe"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn release_with_reason_and_logout() {
    let h = harness();
    let token = h.token("ada@example.com").await;
    h.seed("item-1", json!({})).await;
    let mut events = h.engine.events.connect();

    let (_, body) = h.call("POST", "/api/tasks/claim", Some(&token), None).await;
    let id = body["task"]["id"].as_str().unwrap().to_string();

    let (status, body) = h
        .call(
            "POST",
            &format!("/api/tasks/{id}/release"),
            Some(&token),
            Some(json!({"reason": "lunch"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"released": true}));

    let names: Vec<&str> = std::iter::from_fn(|| events.try_recv())
        .map(|e| e.kind.name())
        .collect();
    assert_eq!(names, vec!["claimed", "released"]);

    let (status, body) = h.call("POST", "/api/sessions/logout", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"logged_out": true}));

    let (status, _) = h.call("GET", "/api/stats", Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
