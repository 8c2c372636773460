//! Crate-wide error type.
//!
//! One variant per wire-visible error kind (see the message protocol's
//! `error` payload and the REST paste-lock gate). `status_hint` lets both
//! the HTTP layer and the WS `error` frame agree on what to report without
//! duplicating the mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("too many requests")]
    TooManyRequests,

    #[error("connection limit exceeded")]
    ConnectionLimitExceeded,

    #[error("session not found")]
    SessionNotFound,

    #[error("session inactive")]
    SessionInactive,

    #[error("invalid invite")]
    InvalidInvite,

    #[error("wrong session")]
    WrongSession,

    #[error("invite expired")]
    InviteExpired,

    #[error("buffer overflow")]
    BufferOverflow,

    #[error("server error: {0}")]
    Server(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

impl CoreError {
    /// The wire-level error code emitted in `error` frames and logged.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::BadRequest(_) => "bad_request",
            CoreError::Unauthorized => "unauthorized",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::TooManyRequests => "too_many_requests",
            CoreError::ConnectionLimitExceeded => "connection_limit_exceeded",
            CoreError::SessionNotFound => "session_not_found",
            CoreError::SessionInactive => "session_inactive",
            CoreError::InvalidInvite => "invalid_invite",
            CoreError::WrongSession => "wrong_session",
            CoreError::InviteExpired => "invite_expired",
            CoreError::BufferOverflow => "buffer_overflow",
            CoreError::Sqlx(_) => "server_error",
            CoreError::Redis(_) => "server_error",
            CoreError::Jwt(_) => "unauthorized",
            CoreError::Server(_) => "server_error",
        }
    }

    /// The HTTP status the REST gate (and the WS upgrade handshake) should
    /// answer with for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) | CoreError::BadRequest(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized | CoreError::Jwt(_) => StatusCode::UNAUTHORIZED,
            CoreError::Forbidden(_)
            | CoreError::SessionInactive
            | CoreError::InviteExpired
            | CoreError::WrongSession => StatusCode::FORBIDDEN,
            CoreError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            CoreError::ConnectionLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            CoreError::SessionNotFound | CoreError::InvalidInvite => StatusCode::NOT_FOUND,
            CoreError::BufferOverflow => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Redis(_) | CoreError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render a sanitized message suitable for a non-development environment.
    pub fn public_message(&self, production: bool) -> String {
        if production
            && matches!(
                self,
                CoreError::Server(_) | CoreError::Redis(_) | CoreError::Sqlx(_)
            )
        {
            "internal error".to_string()
        } else {
            self.to_string()
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let body = Json(serde_json::json!({
            "error": code,
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
