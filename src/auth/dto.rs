use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::User;

/// Request body for sign-up. Missing fields deserialize as empty and are
/// rejected by validation.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SignupRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub confirm: String,
}

/// Request body for the email/password callback.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CredentialsRequest {
    pub email: String,
    pub password: String,
}

/// Public part of the user returned to the client.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
        }
    }
}

/// Response after a successful credentials callback.
#[derive(Debug, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub url: String,
    pub user: PublicUser,
    #[serde(with = "time::serde::rfc3339")]
    pub expires: OffsetDateTime,
}

/// Active session, as returned by `GET /auth/session`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub user: PublicUser,
    #[serde(with = "time::serde::rfc3339")]
    pub expires: OffsetDateTime,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignoutResponse {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "signinUrl")]
    pub signin_url: String,
    #[serde(rename = "callbackUrl")]
    pub callback_url: String,
}

pub type ProvidersResponse = BTreeMap<String, ProviderInfo>;
