use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Provider name of the password account linked to every registered user.
pub const CREDENTIALS_PROVIDER: &str = "credentials";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "login_method", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LoginMethod {
    Email,
    Phone,
    Oauth,
}

/// User record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>, // None for federated-only users
    pub verified: bool,
    pub status: UserStatus,
    pub login_method: LoginMethod,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }
}

/// Link between a user and an auth provider, keyed by (provider, provider_account_id).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub provider: String,
    pub provider_account_id: String,
    pub user_id: Uuid,
    pub account_type: String,
    pub created_at: OffsetDateTime,
}

/// Server-side session row. Only the digest of the cookie token is kept.
#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub token_hash: Vec<u8>,
    pub user_id: Uuid,
    pub expires_at: OffsetDateTime,
}

impl Session {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

/// Input for creating a user row.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub verified: bool,
    pub login_method: LoginMethod,
}

/// Provider account inserted alongside a new user.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub provider: String,
    pub provider_account_id: String,
    pub account_type: String,
}
