use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::auth::dto::SignupRequest;
use crate::auth::password::{hash_password_blocking, verify_password_blocking};
use crate::auth::repo::{AuthStore, StoreError};
use crate::auth::repo_types::{LoginMethod, NewAccount, NewUser, User, CREDENTIALS_PROVIDER};
use crate::auth::session::{IssuedSession, SessionIssuer};
use crate::error::AuthError;

/// Provider id of the email/password sign-in flow, as used in callback URLs.
pub const EMAIL_PASSWORD_PROVIDER_ID: &str = "email-password";

const OAUTH_ACCOUNT_TYPE: &str = "oauth";

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Create a user with a linked credentials account.
///
/// User, account and first password-history row are written in one
/// transaction, so a failure leaves nothing behind.
#[instrument(skip(store, req), fields(email = %req.email))]
pub async fn register(store: &dyn AuthStore, req: SignupRequest) -> Result<User, AuthError> {
    let name = req.name.trim().to_string();
    let email = normalize_email(&req.email);

    if name.is_empty() || email.is_empty() || req.password.is_empty() || req.confirm.is_empty() {
        return Err(AuthError::Validation("invalid user parameters".into()));
    }
    if !is_valid_email(&email) {
        return Err(AuthError::Validation("invalid email".into()));
    }
    if req.password != req.confirm {
        return Err(AuthError::Validation("password missmatch".into()));
    }

    if store.find_user_by_email(&email).await?.is_some() {
        warn!("email already registered");
        return Err(user_exists());
    }

    let password_hash = hash_password_blocking(req.password).await?;
    let id = Uuid::new_v4();
    let user = store
        .create_user_with_account(
            NewUser {
                id,
                name,
                email,
                password_hash: Some(password_hash),
                verified: false,
                login_method: LoginMethod::Email,
            },
            NewAccount {
                provider: CREDENTIALS_PROVIDER.into(),
                provider_account_id: id.to_string(),
                account_type: CREDENTIALS_PROVIDER.into(),
            },
        )
        .await
        .map_err(|e| match e {
            // lost a race with a concurrent sign-up for the same email
            StoreError::Conflict => user_exists(),
            StoreError::Other(e) => AuthError::Internal(e.context("create user and account")),
        })?;

    info!(user_id = %user.id, "user registered");
    Ok(user)
}

fn user_exists() -> AuthError {
    AuthError::Conflict("user already exists".into())
}

/// Check an email/password pair.
///
/// `Ok(None)` for every rejection: unknown email, no password on file, no
/// credentials account, deleted account, unreadable stored hash, wrong
/// password. Each path runs one hash verification.
#[instrument(skip(store, password))]
pub async fn authenticate(
    store: &dyn AuthStore,
    email: &str,
    password: &str,
) -> anyhow::Result<Option<User>> {
    let email = normalize_email(email);
    let user = if email.is_empty() || password.is_empty() {
        None
    } else {
        store.find_user_by_email(&email).await?
    };

    let mut stored_hash = None;
    if let Some(u) = user.as_ref().filter(|u| u.is_active()) {
        // a hash only counts when the password provider is linked to the user
        if u.password_hash.is_some() && store.has_account(u.id, CREDENTIALS_PROVIDER).await? {
            stored_hash = u.password_hash.clone();
        }
    }
    let matched = verify_password_blocking(password.to_string(), stored_hash)
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "password verification failed");
            false
        });

    match user {
        Some(user) if matched => {
            debug!(user_id = %user.id, "credentials accepted");
            Ok(Some(user))
        }
        _ => {
            warn!("credentials rejected");
            Ok(None)
        }
    }
}

/// Identity asserted by an external provider after its own verification.
#[derive(Debug, Clone)]
pub struct FederatedProfile {
    pub provider: String,
    pub provider_account_id: String,
    pub name: String,
    pub email: String,
}

/// Sign in through an external provider and issue a session through the
/// same authority as password sign-in.
///
/// A new provider account is only created together with a new user. An email
/// already owned by another user is refused rather than linked.
#[instrument(skip(store, sessions, profile), fields(provider = %profile.provider))]
pub async fn sign_in_federated(
    store: &dyn AuthStore,
    sessions: &SessionIssuer,
    profile: FederatedProfile,
) -> Result<(User, IssuedSession), AuthError> {
    let email = normalize_email(&profile.email);
    if profile.provider.is_empty() || profile.provider_account_id.is_empty() || email.is_empty() {
        return Err(AuthError::Validation("invalid provider profile".into()));
    }
    if profile.provider == CREDENTIALS_PROVIDER {
        return Err(AuthError::UnknownProvider);
    }

    let user = match store
        .find_user_by_account(&profile.provider, &profile.provider_account_id)
        .await?
    {
        Some(user) => user,
        None => create_federated_user(store, &profile, email).await?,
    };

    if !user.is_active() {
        return Err(AuthError::InvalidCredentials);
    }

    let issued = sessions.issue(user.id).await?;
    info!(user_id = %user.id, "federated sign-in");
    Ok((user, issued))
}

async fn create_federated_user(
    store: &dyn AuthStore,
    profile: &FederatedProfile,
    email: String,
) -> Result<User, AuthError> {
    if store.find_user_by_email(&email).await?.is_some() {
        warn!("federated email belongs to an existing user");
        return Err(account_not_linked());
    }

    let name = if profile.name.trim().is_empty() {
        email.clone()
    } else {
        profile.name.trim().to_string()
    };
    let created = store
        .create_user_with_account(
            NewUser {
                id: Uuid::new_v4(),
                name,
                email,
                password_hash: None,
                verified: true,
                login_method: LoginMethod::Oauth,
            },
            NewAccount {
                provider: profile.provider.clone(),
                provider_account_id: profile.provider_account_id.clone(),
                account_type: OAUTH_ACCOUNT_TYPE.into(),
            },
        )
        .await;
    match created {
        Ok(user) => Ok(user),
        // a concurrent sign-in may have created this provider account first
        Err(StoreError::Conflict) => store
            .find_user_by_account(&profile.provider, &profile.provider_account_id)
            .await?
            .ok_or_else(account_not_linked),
        Err(StoreError::Other(e)) => Err(AuthError::Internal(e)),
    }
}

fn account_not_linked() -> AuthError {
    AuthError::Conflict("account not linked".into())
}
