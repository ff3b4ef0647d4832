//! PC/SC backend for the secure element capability
//!
//! [`PcscService`] implements [`remocard_apdu_core::SmartcardService`] on top of
//! the platform PC/SC resource manager (pcsc-lite, WinSCard). Each session is a
//! shared-mode card connection; logical channels are opened with MANAGE
//! CHANNEL and selected by AID, falling back to the basic channel on cards
//! without logical channel support.
//!
//! [`CardMonitor`] watches for reader and card changes on a background thread
//! and reports them over a `crossbeam-channel`.
//!
//! ```no_run
//! use remocard_apdu_core::SmartcardService;
//! use remocard_apdu_transport_pcsc::PcscService;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = PcscService::establish()?;
//! for reader in service.readers()? {
//!     println!("{} (card present: {})", reader.name, reader.present);
//! }
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![warn(missing_docs)]

mod config;
mod error;
pub mod event;
mod monitor;
mod reader;
mod service;
mod session;

pub use config::{PcscConfig, ShareMode};
pub use error::PcscError;
pub use event::{CardEvent, PcscEvent, ReaderEvent};
pub use monitor::CardMonitor;
pub use reader::PcscReader;
pub use service::PcscService;
pub use session::{PcscChannel, PcscSession};

// Re-export some pcsc types for convenience
pub use pcsc::{Protocols, Scope};
