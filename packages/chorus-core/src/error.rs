//! Centralized error types for the Chorus core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::spotify::api::SpotifyError;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

impl ErrorCode for SpotifyError {
    fn code(&self) -> &'static str {
        match self {
            Self::Http(_) => "http_request_failed",
            Self::NoActiveDevice => "no_active_device",
            Self::Unauthorized => "provider_unauthorized",
            Self::Forbidden => "provider_forbidden",
            Self::NotFound => "provider_not_found",
            Self::Api(_, _) => "provider_api_error",
            Self::Parse(_) => "provider_parse_error",
        }
    }
}

/// Application-wide error type for the Chorus server.
#[derive(Debug, Error)]
pub enum ChorusError {
    /// Client sent an unparseable or unsupported provider reference,
    /// or a request with missing fields. Never mutates server state.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Login attempted for a session that carries neither a complete
    /// provider identity nor a complete listener identity.
    #[error("Invalid session: {0}")]
    UnauthorizedSession(String),

    /// A conductor-only operation was issued by a non-conductor session.
    #[error("Only the conductor may perform this action")]
    NotConductor,

    /// A `take_master_control` request from a session that is not
    /// allow-listed or holds no provider token.
    #[error("Not permitted to take master control")]
    ControlDenied,

    /// The provider reported no active playback device for this account.
    #[error("No active playback device")]
    NoActiveDevice,

    /// The provider rejected the access token and a refresh did not recover.
    #[error("Provider authorization failed")]
    ProviderUnauthorized,

    /// The provider refused access to a resource (unreadable playlist,
    /// missing track). The previous state is kept.
    #[error("Provider denied access: {0}")]
    ProviderDenied(String),

    /// A nominated track was not observed playing within the failure window.
    #[error("Playback failed: {0}")]
    PlaybackFailure(String),

    /// Persistence failed. Logged and never blocks the mutation.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Transient or unclassified provider failure.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChorusError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::UnauthorizedSession(_) => "invalid_session",
            Self::NotConductor => "not_conductor",
            Self::ControlDenied => "control_denied",
            Self::NoActiveDevice => "no_active_device",
            Self::ProviderUnauthorized => "provider_unauthorized",
            Self::ProviderDenied(_) => "provider_denied",
            Self::PlaybackFailure(_) => "playback_failure",
            Self::Persistence(_) => "persistence_error",
            Self::Provider(_) => "provider_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::ProviderDenied(_) => StatusCode::BAD_REQUEST,
            Self::UnauthorizedSession(_) => StatusCode::UNAUTHORIZED,
            Self::NotConductor | Self::ControlDenied => StatusCode::FORBIDDEN,
            Self::NoActiveDevice | Self::ProviderUnauthorized => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type ChorusResult<T> = Result<T, ChorusError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for ChorusError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<SpotifyError> for ChorusError {
    fn from(err: SpotifyError) -> Self {
        match err {
            SpotifyError::NoActiveDevice => Self::NoActiveDevice,
            SpotifyError::Unauthorized => Self::ProviderUnauthorized,
            SpotifyError::Forbidden | SpotifyError::NotFound => {
                Self::ProviderDenied(err.to_string())
            }
            other => Self::Provider(other.to_string()),
        }
    }
}
