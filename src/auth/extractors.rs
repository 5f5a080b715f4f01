use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::auth::repo_types::{Session, User};
use crate::error::AuthError;
use crate::state::AppState;

/// Resolves the session cookie, if any, to the signed-in user.
///
/// Never rejects for a missing or stale cookie; only store failures bubble
/// up as errors.
pub struct MaybeSession(pub Option<(Session, User)>);

#[async_trait]
impl FromRequestParts<AppState> for MaybeSession {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = state.sessions.token_from_headers(&parts.headers) else {
            return Ok(MaybeSession(None));
        };
        let resolved = state.sessions.resolve(&token).await?;
        Ok(MaybeSession(resolved))
    }
}

/// Like [`MaybeSession`] but rejects with 401 when there is no live session.
pub struct SessionUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for SessionUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        match MaybeSession::from_request_parts(parts, state).await? {
            MaybeSession(Some((_, user))) => Ok(SessionUser(user)),
            MaybeSession(None) => Err(AuthError::InvalidCredentials),
        }
    }
}
