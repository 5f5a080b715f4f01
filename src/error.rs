use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors surfaced by the auth endpoints.
///
/// Every variant renders as `{"statusText": "..."}`.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),

    /// Duplicate email and similar. Reported as 400, not 409.
    #[error("{0}")]
    Conflict(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("unknown provider")]
    UnknownProvider,

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "statusText")]
    pub status_text: String,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Validation(_) | AuthError::Conflict(_) => StatusCode::BAD_REQUEST,
            AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AuthError::UnknownProvider | AuthError::NotFound => StatusCode::NOT_FOUND,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let status_text = match &self {
            AuthError::Internal(e) => {
                error!(error = %e, "internal error");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(ErrorBody { status_text })).into_response()
    }
}
