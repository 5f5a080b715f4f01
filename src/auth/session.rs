//! Server-side sessions: the single authority that mints, resolves and
//! revokes session tokens for every sign-in flow.

use std::sync::Arc;

use anyhow::Context;
use axum::http::{header::InvalidHeaderValue, HeaderMap, HeaderValue};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use time::{format_description::FormatItem, macros::format_description, Duration, OffsetDateTime};
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::repo::AuthStore;
use crate::auth::repo_types::{Session, User};
use crate::config::SessionConfig;

pub const SESSION_COOKIE_NAME: &str = "next-auth.session-token";
const SECURE_COOKIE_PREFIX: &str = "__Secure-";

const COOKIE_DATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Token handed back to the caller after a successful sign-in.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct SessionIssuer {
    store: Arc<dyn AuthStore>,
    config: SessionConfig,
}

impl SessionIssuer {
    pub fn new(store: Arc<dyn AuthStore>, config: SessionConfig) -> Self {
        Self { store, config }
    }

    pub fn max_age(&self) -> Duration {
        Duration::days(self.config.max_age_days)
    }

    pub fn cookie_name(&self) -> String {
        if self.config.cookie_secure {
            format!("{SECURE_COOKIE_PREFIX}{SESSION_COOKIE_NAME}")
        } else {
            SESSION_COOKIE_NAME.to_string()
        }
    }

    /// Mint and persist a new session for `user_id`.
    pub async fn issue(&self, user_id: Uuid) -> anyhow::Result<IssuedSession> {
        let token = generate_session_token()?;
        let expires_at = OffsetDateTime::now_utc() + self.max_age();
        self.store
            .insert_session(&Session {
                token_hash: hash_session_token(&token),
                user_id,
                expires_at,
            })
            .await
            .context("persist session")?;
        debug!(user_id = %user_id, %expires_at, "session issued");
        Ok(IssuedSession {
            token,
            user_id,
            expires_at,
        })
    }

    /// Resolve a raw token to its live session and owning user.
    ///
    /// Expired rows are removed on sight and never resolve.
    pub async fn resolve(&self, token: &str) -> anyhow::Result<Option<(Session, User)>> {
        let token_hash = hash_session_token(token);
        let Some(session) = self.store.find_session(&token_hash).await? else {
            return Ok(None);
        };
        if session.is_expired(OffsetDateTime::now_utc()) {
            self.store.delete_session(&token_hash).await?;
            debug!(user_id = %session.user_id, "expired session dropped");
            return Ok(None);
        }
        match self.store.find_user_by_id(session.user_id).await? {
            Some(user) if user.is_active() => Ok(Some((session, user))),
            _ => Ok(None),
        }
    }

    pub async fn revoke(&self, token: &str) -> anyhow::Result<bool> {
        self.store.delete_session(&hash_session_token(token)).await
    }

    /// Delete every session whose expiry is at or before `now`.
    pub async fn sweep(&self, now: OffsetDateTime) -> anyhow::Result<u64> {
        let removed = self.store.delete_expired_sessions(now).await?;
        if removed > 0 {
            info!(removed, "expired sessions swept");
        }
        Ok(removed)
    }

    pub fn cookie(&self, issued: &IssuedSession) -> anyhow::Result<HeaderValue> {
        let max_age = (issued.expires_at - OffsetDateTime::now_utc())
            .whole_seconds()
            .max(0);
        let expires = issued
            .expires_at
            .to_offset(time::UtcOffset::UTC)
            .format(COOKIE_DATE)
            .context("format cookie expiry")?;
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}; Expires={expires}",
            self.cookie_name(),
            issued.token
        );
        if self.config.cookie_secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie).context("encode session cookie")
    }

    pub fn clear_cookie(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut cookie = format!(
            "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
            self.cookie_name()
        );
        if self.config.cookie_secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie)
    }

    /// Pull this issuer's session token out of the `Cookie` header.
    pub fn token_from_headers(&self, headers: &HeaderMap) -> Option<String> {
        let name = self.cookie_name();
        headers
            .get_all(axum::http::header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| key.trim() == name)
            .map(|(_, val)| val.trim().to_string())
            .filter(|val| !val.is_empty())
    }
}

/// 32 bytes from the OS RNG, base64url without padding.
pub(crate) fn generate_session_token() -> anyhow::Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate session token")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Only this digest is stored; raw tokens never reach the database.
pub(crate) fn hash_session_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}
