//! Bridge error taxonomy and its HTTP mapping

use axum::{Extension, Json};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::api::ErrorResponse;
use crate::overlay::{OverlayError, Plaintext};

/// Errors surfaced to remote callers
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Missing or wrong bearer credential
    #[error("Invalid password")]
    Unauthorized,

    /// Reader excluded by the allow-list
    #[error("Reader not allowed")]
    AccessDenied,

    /// Reader unknown to the service
    #[error("Reader not found")]
    ReaderNotFound,

    /// No channel registered for the requested key
    #[error("Channel not found for reader {reader} and AID {aid}. Call openChannel first.")]
    ChannelNotFound {
        /// Reader name
        reader: String,
        /// Application identifier
        aid: String,
    },

    /// Session header names no handshake session
    #[error("Invalid session")]
    InvalidSession,

    /// Malformed request
    #[error("{0}")]
    Protocol(String),

    /// Failure reported by the secure element stack
    #[error(transparent)]
    Card(#[from] remocard_apdu_core::Error),

    /// Request body could not be decrypted
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Settings could not be loaded or persisted
    #[error("Settings error: {0}")]
    Settings(String),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// HTTP status for this error
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized | Self::InvalidSession => StatusCode::UNAUTHORIZED,
            Self::AccessDenied => StatusCode::FORBIDDEN,
            Self::ReaderNotFound | Self::ChannelNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Protocol(_) | Self::Encryption(_) => StatusCode::BAD_REQUEST,
            Self::Card(e) if e.is_protocol() => StatusCode::BAD_REQUEST,
            Self::Card(remocard_apdu_core::Error::ReaderNotFound(_)) => StatusCode::NOT_FOUND,
            Self::Card(_) | Self::Settings(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable code, where one is defined
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::Unauthorized => Some("invalid_password"),
            Self::AccessDenied => Some("access_denied"),
            Self::InvalidSession => Some("invalid_session"),
            Self::Encryption(_) => Some("encryption_failed"),
            _ => None,
        }
    }

    /// Wire payload for this error
    pub fn body(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.to_string(),
            code: self.code().map(str::to_owned),
        }
    }
}

impl From<OverlayError> for BridgeError {
    fn from(error: OverlayError) -> Self {
        match error {
            OverlayError::InvalidSession => Self::InvalidSession,
            other => Self::Encryption(other.to_string()),
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        } else {
            debug!(error = %self, %status, "Request rejected");
        }

        let body = Json(self.body());
        if matches!(self, Self::InvalidSession | Self::Encryption(_)) {
            // The caller holds no usable key for a sealed reply
            (status, Extension(Plaintext), body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
