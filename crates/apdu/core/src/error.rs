//! Core error type for all APDU operations
//!
//! Backends convert their own failures into this type at the capability
//! boundary so that callers only ever deal with one error enum.

use crate::status::StatusWord;

/// Core error type that encompasses all possible errors in the crate
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    //
    // Transport related errors
    //
    /// The secure element service is not available on this host
    #[error("Secure element service unavailable")]
    ServiceUnavailable,

    /// Reader does not exist
    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    /// Reader exists but no secure element is present
    #[error("No secure element present in reader: {0}")]
    NoCard(String),

    /// The session was already closed
    #[error("Session closed")]
    SessionClosed,

    /// The channel was already closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The card has no free logical channel left
    #[error("No logical channel available")]
    NoChannelAvailable,

    /// Failure reported by the underlying driver
    #[error("Transport error: {0}")]
    Transport(String),

    //
    // Protocol related errors
    //
    /// Response was shorter than a status word
    #[error("Response too short: {0} bytes")]
    ResponseTooShort(usize),

    /// Command bytes are not a valid APDU
    #[error("Invalid command: {0}")]
    InvalidCommand(&'static str),

    /// Hex input could not be decoded
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    /// The card kept answering 61xx past the chaining limit
    #[error("Chain limit exceeded after {0} GET RESPONSE frames")]
    ChainLimitExceeded(usize),

    /// Unexpected status word during a protocol step
    #[error("Unexpected status {status} ({})", status.description())]
    UnexpectedStatus {
        /// Status word returned by the card
        status: StatusWord,
    },
}

impl Error {
    /// Create a transport error from any displayable driver failure
    pub fn transport<S: ToString>(message: S) -> Self {
        Self::Transport(message.to_string())
    }

    /// Whether this error describes malformed protocol data rather than a
    /// failure of the underlying hardware path
    pub const fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::ResponseTooShort(_)
                | Self::InvalidCommand(_)
                | Self::InvalidHex(_)
                | Self::ChainLimitExceeded(_)
                | Self::UnexpectedStatus { .. }
        )
    }
}

/// Result alias used across the crate
pub type Result<T, E = Error> = core::result::Result<T, E>;
