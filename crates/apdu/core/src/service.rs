//! Secure element capability traits
//!
//! A [`SmartcardService`] enumerates readers and opens [`Session`]s; a session
//! opens logical [`Channel`]s by AID. Each hardware backend implements the
//! three traits and the bridge only ever talks to trait objects, so the same
//! registry and HTTP surface drive PC/SC hardware, the unavailable fallback
//! and the scripted mock alike.

use std::fmt;

use bytes::Bytes;

use crate::{Error, Result};

/// A card reader (slot) as seen by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderInfo {
    /// Reader name, unique within the service
    pub name: String,
    /// Whether a secure element is currently present
    pub present: bool,
}

impl ReaderInfo {
    /// Create a reader description
    pub fn new(name: impl Into<String>, present: bool) -> Self {
        Self {
            name: name.into(),
            present,
        }
    }
}

/// Entry point to a secure element backend
pub trait SmartcardService: Send + Sync + fmt::Debug {
    /// All readers currently known to the backend
    fn readers(&self) -> Result<Vec<ReaderInfo>>;

    /// Open a session to the secure element in `reader`
    fn open_session(&self, reader: &str) -> Result<Box<dyn Session>>;

    /// Whether the backend is usable at all
    fn is_available(&self) -> bool {
        true
    }

    /// Release backend resources; later calls may fail
    fn shutdown(&self) {}
}

/// A connection to the secure element in one reader
pub trait Session: Send + Sync + fmt::Debug {
    /// Name of the reader this session is bound to
    fn reader(&self) -> &str;

    /// Open a logical channel and select `aid` on it
    ///
    /// Returns `Ok(None)` when the card refuses the selection; errors are
    /// reserved for transport failures.
    fn open_logical_channel(&self, aid: &[u8]) -> Result<Option<Box<dyn Channel>>>;

    /// Close the session and every channel opened through it
    fn close(&self) -> Result<()>;

    /// Whether [`Session::close`] has been called or the card went away
    fn is_closed(&self) -> bool;
}

/// A logical channel with an application selected on it
pub trait Channel: Send + fmt::Debug {
    /// Send one raw command frame and return the raw response (payload + SW)
    fn transmit(&mut self, command: &[u8]) -> Result<Bytes>;

    /// Close the channel
    fn close(&mut self) -> Result<()>;

    /// Logical channel number
    fn number(&self) -> u8;
}

/// Backend used when no secure element service can be reached
///
/// Reports no readers and refuses every session.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableService;

impl SmartcardService for UnavailableService {
    fn readers(&self) -> Result<Vec<ReaderInfo>> {
        Ok(Vec::new())
    }

    fn open_session(&self, _reader: &str) -> Result<Box<dyn Session>> {
        Err(Error::ServiceUnavailable)
    }

    fn is_available(&self) -> bool {
        false
    }
}
