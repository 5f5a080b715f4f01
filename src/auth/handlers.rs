use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::SET_COOKIE, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::{
    auth::{
        dto::{
            CallbackResponse, CredentialsRequest, ProviderInfo, ProvidersResponse, PublicUser,
            SessionResponse, SignoutResponse, SignupRequest,
        },
        extractors::{MaybeSession, SessionUser},
        services::{authenticate, register, EMAIL_PASSWORD_PROVIDER_ID},
    },
    error::AuthError,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/callback/:provider", post(callback))
        .route("/auth/session", get(session))
        .route("/auth/providers", get(providers))
        .route("/auth/signout", post(signout))
        .route("/auth/*rest", any(unknown_auth_route))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

/// Clients post JSON without a `Content-Type`, so bodies are read as raw bytes.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, serde_json::Error> {
    serde_json::from_slice(body)
}

#[instrument(skip(state, body))]
pub async fn signup(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<PublicUser>, AuthError> {
    let payload: SignupRequest = parse_body(&body).map_err(|e| {
        warn!(error = %e, "unreadable signup body");
        AuthError::Validation("invalid user parameters".into())
    })?;
    let user = register(state.store.as_ref(), payload).await?;
    Ok(Json(PublicUser::from(&user)))
}

/// Sign-in callback. Only the email/password provider is served here; it is
/// the one place a session cookie gets set.
#[instrument(skip(state, body))]
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    body: Bytes,
) -> Result<Response, AuthError> {
    if provider != EMAIL_PASSWORD_PROVIDER_ID {
        warn!(%provider, "callback for unknown provider");
        return Err(AuthError::UnknownProvider);
    }
    let payload: CredentialsRequest = parse_body(&body).map_err(|e| {
        warn!(error = %e, "unreadable credentials body");
        AuthError::InvalidCredentials
    })?;

    let user = authenticate(state.store.as_ref(), &payload.email, &payload.password)
        .await?
        .ok_or(AuthError::InvalidCredentials)?;

    let issued = state.sessions.issue(user.id).await?;
    let cookie = state.sessions.cookie(&issued).map_err(|e| {
        error!(error = %e, "session cookie encoding failed");
        AuthError::Internal(e)
    })?;

    info!(user_id = %issued.user_id, "signed in");
    let body = CallbackResponse {
        url: state.config.base_url.clone(),
        user: PublicUser::from(&user),
        expires: issued.expires_at,
    };
    Ok((StatusCode::OK, [(SET_COOKIE, cookie)], Json(body)).into_response())
}

/// Current session, or `{}` when signed out.
#[instrument(skip_all)]
pub async fn session(MaybeSession(current): MaybeSession) -> Response {
    match current {
        Some((session, user)) => Json(SessionResponse {
            user: PublicUser::from(&user),
            expires: session.expires_at,
        })
        .into_response(),
        None => Json(json!({})).into_response(),
    }
}

pub async fn providers(State(state): State<AppState>) -> Json<ProvidersResponse> {
    let base = state.config.base_url.trim_end_matches('/');
    let mut providers = ProvidersResponse::new();
    providers.insert(
        EMAIL_PASSWORD_PROVIDER_ID.to_string(),
        ProviderInfo {
            id: EMAIL_PASSWORD_PROVIDER_ID.to_string(),
            name: "Email and Password".to_string(),
            kind: "credentials".to_string(),
            signin_url: format!("{base}/api/auth/signin/{EMAIL_PASSWORD_PROVIDER_ID}"),
            callback_url: format!("{base}/api/auth/callback/{EMAIL_PASSWORD_PROVIDER_ID}"),
        },
    );
    Json(providers)
}

/// Revoke the current session. The cookie is cleared even when no session
/// row was found.
#[instrument(skip_all)]
pub async fn signout(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Response, AuthError> {
    if let Some(token) = state.sessions.token_from_headers(&headers) {
        if state.sessions.revoke(&token).await? {
            info!("signed out");
        }
    }
    let cleared = state
        .sessions
        .clear_cookie()
        .map_err(|e| AuthError::Internal(e.into()))?;
    let body = SignoutResponse {
        url: state.config.base_url.clone(),
    };
    Ok((StatusCode::OK, [(SET_COOKIE, cleared)], Json(body)).into_response())
}

async fn unknown_auth_route() -> AuthError {
    AuthError::NotFound
}

#[instrument(skip_all)]
pub async fn get_me(SessionUser(user): SessionUser) -> Json<PublicUser> {
    Json(PublicUser::from(&user))
}
