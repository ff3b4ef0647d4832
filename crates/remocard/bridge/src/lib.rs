//! RemoCard bridge
//!
//! Exposes the secure elements attached to this host to remote clients over
//! HTTP. Clients open logical channels by AID, exchange APDUs on them and close
//! them again; the bridge follows response chaining on their behalf and keeps
//! one session per reader and one channel per `(reader, AID)`.
//!
//! When a password is configured, callers authenticate with it as a bearer
//! credential and request and response bodies are sealed with AES-256-CBC,
//! keyed either from the password or from a per-client handshake.
//!
//! ```no_run
//! use remocard_bridge::config::{Overrides, SettingsStore, default_config_path};
//!
//! # async fn run() -> eyre::Result<()> {
//! let settings = SettingsStore::load(default_config_path()?, Overrides::default())?;
//! remocard_bridge::server::run(settings).await
//! # }
//! ```
#![forbid(unsafe_code)]

pub mod activity;
pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod handshake;
pub mod overlay;
pub mod registry;
pub mod router;
pub mod server;
pub mod slots;
pub mod state;

pub use config::{Settings, SettingsStore};
pub use error::BridgeError;
pub use router::{SESSION_HEADER, router};
pub use state::AppState;
