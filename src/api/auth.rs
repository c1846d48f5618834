//! Bearer-token extractor.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use super::AppState;
use super::error::ApiError;
use crate::error::Error;
use crate::model::Principal;
use crate::store::Store;

pub const BEARER_PREFIX: &str = "Bearer ";

/// The principal behind the request's `Authorization: Bearer <token>` header.
/// Resolving it slides the session's expiry.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Principal);

pub fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix(BEARER_PREFIX)
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

impl<S: Store> FromRequestParts<AppState<S>> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState<S>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(Error::SessionInvalid)?;
        let principal = state.engine.sessions.authenticate(token).await?;
        Ok(Self(principal))
    }
}
