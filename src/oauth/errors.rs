use crate::errors::TollgateError;
use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Failures surfaced on the token endpoint.
///
/// Every variant carries a message that is safe to show to the caller.
/// Internal causes only travel inside [`OAuthError::ServerError`] and are
/// never rendered.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("{0}")]
    InvalidRequest(String),

    /// `challenge` is set when the client tried HTTP Basic authentication.
    #[error("{message}")]
    InvalidClient { message: String, challenge: bool },

    #[error("{0}")]
    InvalidGrant(String),

    #[error("{0}")]
    UnauthorizedClient(String),

    #[error("{0}")]
    UnsupportedGrantType(String),

    #[error("{0}")]
    InvalidScope(String),

    #[error("{0}")]
    InvalidToken(String),

    #[error("{0}")]
    Forbidden(String),

    /// Malformed or mismatching argument supplied by the caller.
    #[error("{0}")]
    InvalidArgument(String),

    /// Internal precondition violated, e.g. a client with an unusable
    /// fingerprint secret.
    #[error("{0}")]
    Misconfigured(String),

    #[error("Server error: an unexpected error occurred")]
    ServerError(#[source] TollgateError),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub error_description: String,
}

impl OAuthError {
    pub fn invalid_client(message: impl Into<String>) -> Self {
        OAuthError::InvalidClient {
            message: message.into(),
            challenge: false,
        }
    }

    /// Wire name placed in the `error` field.
    pub fn name(&self) -> &'static str {
        match self {
            OAuthError::InvalidRequest(_) => "invalid_request",
            OAuthError::InvalidClient { .. } => "invalid_client",
            OAuthError::InvalidGrant(_) => "invalid_grant",
            OAuthError::UnauthorizedClient(_) => "unauthorized_client",
            OAuthError::UnsupportedGrantType(_) => "unsupported_grant_type",
            OAuthError::InvalidScope(_) => "invalid_scope",
            OAuthError::InvalidToken(_) => "invalid_token",
            OAuthError::Forbidden(_) => "forbidden",
            OAuthError::InvalidArgument(_) | OAuthError::Misconfigured(_) => "invalid_argument",
            OAuthError::ServerError(_) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            OAuthError::InvalidClient {
                challenge: true, ..
            } => StatusCode::UNAUTHORIZED,
            OAuthError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            OAuthError::Forbidden(_) => StatusCode::FORBIDDEN,
            OAuthError::Misconfigured(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OAuthError::ServerError(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// True when the response must carry a `WWW-Authenticate: Basic` challenge.
    pub fn wants_basic_challenge(&self) -> bool {
        matches!(
            self,
            OAuthError::InvalidClient {
                challenge: true,
                ..
            }
        )
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.name(),
            error_description: self.to_string(),
        }
    }
}

impl From<TollgateError> for OAuthError {
    fn from(value: TollgateError) -> Self {
        OAuthError::ServerError(value)
    }
}
