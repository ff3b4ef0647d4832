//! Core types for talking to a secure element over APDUs
//!
//! This crate provides the foundational pieces shared by the RemoCard bridge and
//! its hardware backends:
//!
//! - status word interpretation and response splitting (ISO/IEC 7816-4)
//! - command APDU classification, hex decoding and logical channel CLA coding
//! - the secure element capability traits ([`SmartcardService`], [`Session`],
//!   [`Channel`]) that hardware backends implement
//! - the [`Transceiver`], which performs command/response chaining over a
//!   single logical channel
//!
//! With the `mock` feature enabled, [`mock::MockService`] provides a scripted
//! in-memory secure element for tests.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod command;
pub mod error;
pub mod service;
pub mod status;
pub mod transceiver;

#[cfg(feature = "mock")]
pub mod mock;

pub use command::{CommandApdu, decode_hex, encode_hex};
pub use error::{Error, Result};
pub use service::{Channel, ReaderInfo, Session, SmartcardService, UnavailableService};
pub use status::StatusWord;
pub use transceiver::Transceiver;

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        Bytes, BytesMut, Channel, CommandApdu, Error, ReaderInfo, Result, Session,
        SmartcardService, StatusWord, Transceiver,
    };
}
