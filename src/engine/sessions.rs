//! Session binding: resolves tokens to principals and ends sessions.
//!
//! Ending a session (logout, expiry, termination) releases the task it
//! holds. Refreshing a session only slides its expiry; claims are left alone.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::tasks::{TaskManager, reason};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::{Principal, Session, SessionId, User, UserId};
use crate::store::Store;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Client details recorded on a new session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

pub struct SessionBinding<S> {
    store: Arc<S>,
    tasks: TaskManager<S>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl<S> Clone for SessionBinding<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            tasks: self.tasks.clone(),
            clock: Arc::clone(&self.clock),
            ttl: self.ttl,
        }
    }
}

impl<S: Store> SessionBinding<S> {
    pub fn new(store: Arc<S>, tasks: TaskManager<S>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            store,
            tasks,
            clock,
            ttl,
        }
    }

    fn ttl(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.ttl)
            .map_err(|e| Error::Config(format!("session ttl out of range: {e}")))
    }

    /// Add a user account. Credentials are checked outside this service.
    pub async fn register_user(&self, email: &str, name: &str) -> Result<User> {
        if email.trim().is_empty() {
            return Err(Error::Validation("email must not be empty".to_string()));
        }
        let user = User::new(email.trim(), name, self.clock.now());
        self.store.insert_user(&user).await?;
        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    /// Start a session for an already-authenticated user.
    pub async fn open_session(&self, user_id: UserId, client: ClientInfo) -> Result<Session> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .filter(|u| u.is_active)
            .ok_or_else(|| Error::Validation(format!("unknown or inactive user {user_id}")))?;

        let now = self.clock.now();
        let session = Session {
            id: SessionId::new(),
            user_id: user.id,
            token: new_token(),
            expires_at: now + self.ttl()?,
            is_active: true,
            last_activity: now,
            client_ip: client.ip,
            user_agent: client.user_agent,
            created_at: now,
        };
        self.store.insert_session(&session).await?;
        metrics::sessions().add(1, &[KeyValue::new("event", "opened")]);
        info!(session_id = %session.id, user_id = %user.id, "session opened");
        Ok(session)
    }

    /// Resolve a bearer token and slide the session's expiry.
    pub async fn authenticate(&self, token: &str) -> Result<Principal> {
        let mut session = self
            .store
            .session_by_token(token)
            .await?
            .filter(|s| s.is_active)
            .ok_or(Error::SessionInvalid)?;

        let now = self.clock.now();
        if session.is_expired_at(now) {
            self.end(session.id, reason::SESSION_EXPIRED).await?;
            metrics::sessions().add(1, &[KeyValue::new("event", "expired")]);
            return Err(Error::SessionExpired);
        }

        let user = self
            .store
            .get_user(session.user_id)
            .await?
            .filter(|u| u.is_active)
            .ok_or(Error::SessionInvalid)?;

        let expires_at = now + self.ttl()?;
        if !self.store.touch_session(session.id, now, expires_at).await? {
            return Err(Error::SessionInvalid);
        }
        session.last_activity = now;
        session.expires_at = expires_at;
        Ok(Principal { user, session })
    }

    pub async fn logout(&self, session: SessionId) -> Result<bool> {
        let ended = self.end(session, reason::LOGOUT).await?;
        metrics::sessions().add(1, &[KeyValue::new("event", "logout")]);
        Ok(ended)
    }

    /// End a session on behalf of an operator or another subsystem.
    pub async fn terminate(&self, session: SessionId, why: &str) -> Result<bool> {
        let ended = self.end(session, why).await?;
        metrics::sessions().add(1, &[KeyValue::new("event", "terminated")]);
        Ok(ended)
    }

    /// Deactivate and release the held task. Returns whether this call
    /// deactivated the session.
    async fn end(&self, session: SessionId, why: &str) -> Result<bool> {
        let deactivated = self
            .store
            .deactivate_session(session, self.clock.now())
            .await?;
        let released = self.tasks.release_held_by(session, why).await?;
        if deactivated {
            info!(
                session_id = %session,
                reason = why,
                released = ?released.iter().map(|t| t.id).collect::<Vec<_>>(),
                "session ended"
            );
        } else {
            debug!(session_id = %session, "session already inactive");
        }
        Ok(deactivated)
    }
}

/// Two random v4 UUIDs, hex encoded.
fn new_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}
