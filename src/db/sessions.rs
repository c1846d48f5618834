//! User and session rows.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Db;
use crate::error::{Error, Result};
use crate::model::{Session, SessionId, User, UserId};
use crate::store::SessionStore;

const SESSION_COLUMNS: &str = "id, user_id, token, expires_at, is_active, last_activity, client_ip, user_agent, created_at";

impl SessionStore for Db {
    async fn insert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, email, credential_hash, name, is_active, is_verified, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(user.id.0)
        .bind(&user.email)
        .bind(&user.credential_hash)
        .bind(&user.name)
        .bind(user.is_active)
        .bind(user.is_verified)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Validation(format!("email {} already registered", user.email))
            }
            e => e.into(),
        })?;
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, email, credential_hash, name, is_active, is_verified, created_at, updated_at
             FROM users WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserRow::into_user))
    }

    async fn insert_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, token, expires_at, is_active, last_activity, client_ip, user_agent, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(session.id.0)
        .bind(session.user_id.0)
        .bind(&session.token)
        .bind(session.expires_at)
        .bind(session.is_active)
        .bind(session.last_activity)
        .bind(&session.client_ip)
        .bind(&session.user_agent)
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        let row: Option<SessionRow> =
            sqlx::query_as(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(SessionRow::into_session))
    }

    async fn session_by_token(&self, token: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> =
            sqlx::query_as(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE token = $1"))
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(SessionRow::into_session))
    }

    async fn touch_session(
        &self,
        id: SessionId,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE sessions SET last_activity = $2, expires_at = $3
             WHERE id = $1 AND is_active",
        )
        .bind(id.0)
        .bind(last_activity)
        .bind(expires_at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows == 1)
    }

    async fn deactivate_session(&self, id: SessionId, at: DateTime<Utc>) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE sessions SET is_active = FALSE, last_activity = $2
             WHERE id = $1 AND is_active",
        )
        .bind(id.0)
        .bind(at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows == 1)
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    credential_hash: String,
    name: String,
    is_active: bool,
    is_verified: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UserRow {
    fn into_user(self) -> User {
        User {
            id: UserId(self.id),
            email: self.email,
            credential_hash: self.credential_hash,
            name: self.name,
            is_active: self.is_active,
            is_verified: self.is_verified,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    token: String,
    expires_at: DateTime<Utc>,
    is_active: bool,
    last_activity: DateTime<Utc>,
    client_ip: Option<String>,
    user_agent: Option<String>,
    created_at: DateTime<Utc>,
}

impl SessionRow {
    fn into_session(self) -> Session {
        Session {
            id: SessionId(self.id),
            user_id: UserId(self.user_id),
            token: self.token,
            expires_at: self.expires_at,
            is_active: self.is_active,
            last_activity: self.last_activity,
            client_ip: self.client_ip,
            user_agent: self.user_agent,
            created_at: self.created_at,
        }
    }
}
