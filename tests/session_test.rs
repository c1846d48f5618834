//! Session binding: token resolution, sliding expiry and claim release on
//! session end.

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;

use reviewq::clock::{Clock, ManualClock};
use reviewq::engine::{ChannelFeed, ClientInfo, Engine, EngineSettings, IngestOutcome};
use reviewq::error::Error;
use reviewq::event::EventKind;
use reviewq::model::{FieldMap, Session, Status, Task, User};
use reviewq::store::{MemoryStore, SessionStore};
use reviewq::config::IngestConfig;

struct Harness {
    engine: Engine<MemoryStore>,
    store: Arc<MemoryStore>,
    clock: ManualClock,
}

fn harness() -> Harness {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap());
    let store = Arc::new(MemoryStore::new());
    let settings = EngineSettings {
        session_ttl: std::time::Duration::from_secs(60 * 60),
        ..EngineSettings::default()
    };
    let engine = Engine::with_clock(Arc::clone(&store), settings, Arc::new(clock.clone()));
    Harness {
        engine,
        store,
        clock,
    }
}

impl Harness {
    async fn login(&self) -> (User, Session) {
        let user = self
            .engine
            .sessions
            .register_user("ada@example.com", "Ada")
            .await
            .unwrap();
        let session = self
            .engine
            .sessions
            .open_session(user.id, ClientInfo::default())
            .await
            .unwrap();
        (user, session)
    }

    async fn claimed_task(&self, session: &Session) -> Task {
        let (_tx, feed) = ChannelFeed::channel(4);
        let processor = self
            .engine
            .queue_processor(Arc::new(feed), IngestConfig::default());
        let mut data = FieldMap::new();
        data.insert("name".into(), json!("Acme"));
        let IngestOutcome::Created(task) = processor.ingest("item-1", data).await.unwrap() else {
            panic!("expected a new task");
        };
        let claimed = self
            .engine
            .tasks
            .claim_next(session.user_id, session.id)
            .await
            .unwrap()
            .into_task()
            .unwrap();
        assert_eq!(claimed.id, task.id);
        claimed
    }
}

#[tokio::test]
async fn open_session_records_client_and_expiry() {
    let h = harness();
    let user = h
        .engine
        .sessions
        .register_user("  grace@example.com ", "Grace")
        .await
        .unwrap();
    assert_eq!(user.email, "grace@example.com");

    let session = h
        .engine
        .sessions
        .open_session(
            user.id,
            ClientInfo {
                ip: Some("10.0.0.7".into()),
                user_agent: Some("curl/8".into()),
            },
        )
        .await
        .unwrap();
    assert!(session.is_active);
    assert_eq!(session.user_id, user.id);
    assert_eq!(session.expires_at, h.clock.now() + Duration::hours(1));
    assert_eq!(session.client_ip.as_deref(), Some("10.0.0.7"));
    assert_eq!(session.token.len(), 64);
}

#[tokio::test]
async fn open_session_rejects_unknown_user() {
    let h = harness();
    let err = h
        .engine
        .sessions
        .open_session(reviewq::model::UserId::new(), ClientInfo::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = h.engine.sessions.register_user(" ", "Nobody").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn registering_an_email_twice_is_rejected() {
    let h = harness();
    h.engine
        .sessions
        .register_user("ada@example.com", "Ada")
        .await
        .unwrap();
    let err = h
        .engine
        .sessions
        .register_user("ada@example.com", "Ada Again")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn authenticate_slides_expiry() {
    let h = harness();
    let (user, session) = h.login().await;

    h.clock.advance(Duration::minutes(45));
    let principal = h.engine.sessions.authenticate(&session.token).await.unwrap();
    assert_eq!(principal.user_id(), user.id);
    assert_eq!(principal.session_id(), session.id);
    assert_eq!(principal.session.expires_at, h.clock.now() + Duration::hours(1));

    // Past the original expiry but within the slid one.
    h.clock.advance(Duration::minutes(45));
    assert!(h.engine.sessions.authenticate(&session.token).await.is_ok());

    let stored = h.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(stored.last_activity, h.clock.now());
}

#[tokio::test]
async fn unknown_token_is_invalid() {
    let h = harness();
    let err = h.engine.sessions.authenticate("nope").await.unwrap_err();
    assert!(matches!(err, Error::SessionInvalid));
}

#[tokio::test]
async fn expired_session_releases_its_claim() {
    let h = harness();
    let (_, session) = h.login().await;
    let task = h.claimed_task(&session).await;
    let mut events = h.engine.events.connect();

    h.clock.advance(Duration::hours(1));
    let err = h.engine.sessions.authenticate(&session.token).await.unwrap_err();
    assert!(matches!(err, Error::SessionExpired));

    let task = h.engine.tasks.get(task.id).await.unwrap();
    assert_eq!(task.status, Status::Pending);
    assert_eq!(task.assigned_session, None);
    assert_eq!(task.retry_count, 0);

    let event = events.try_recv().expect("released event");
    assert_eq!(
        event.kind,
        EventKind::Released {
            task_id: task.id,
            reason: "session_expired".to_string(),
        }
    );

    let err = h.engine.sessions.authenticate(&session.token).await.unwrap_err();
    assert!(matches!(err, Error::SessionInvalid));
}

#[tokio::test]
async fn logout_releases_claim_and_invalidates_token() {
    let h = harness();
    let (_, session) = h.login().await;
    let task = h.claimed_task(&session).await;

    assert!(h.engine.sessions.logout(session.id).await.unwrap());
    assert!(!h.engine.sessions.logout(session.id).await.unwrap());

    let task = h.engine.tasks.get(task.id).await.unwrap();
    assert_eq!(task.status, Status::Pending);

    let err = h.engine.sessions.authenticate(&session.token).await.unwrap_err();
    assert!(matches!(err, Error::SessionInvalid));
}

#[tokio::test]
async fn refresh_does_not_touch_the_claim() {
    let h = harness();
    let (_, session) = h.login().await;
    let task = h.claimed_task(&session).await;

    h.clock.advance(Duration::minutes(10));
    h.engine.sessions.authenticate(&session.token).await.unwrap();

    let task = h.engine.tasks.get(task.id).await.unwrap();
    assert_eq!(task.status, Status::InProgress);
    assert_eq!(task.assigned_session, Some(session.id));
}

#[tokio::test]
async fn terminate_ends_a_session_without_a_claim() {
    let h = harness();
    let (_, session) = h.login().await;

    assert!(h.engine.sessions.terminate(session.id, "admin").await.unwrap());
    let stored = h.store.get_session(session.id).await.unwrap().unwrap();
    assert!(!stored.is_active);
}
