//! PC/SC implementation of the secure element service

use std::ffi::CString;
use std::fmt;

use pcsc::{Context, ReaderState, State};
use remocard_apdu_core::{ReaderInfo, Result, Session, SmartcardService};
use tracing::{debug, info, warn};

use crate::config::PcscConfig;
use crate::error::PcscError;
use crate::monitor::CardMonitor;
use crate::reader::PcscReader;
use crate::session::PcscSession;

/// Secure element service backed by the PC/SC resource manager
pub struct PcscService {
    /// PC/SC context
    context: Context,
    /// Connection options
    config: PcscConfig,
}

impl fmt::Debug for PcscService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PcscService {
    /// Establish a PC/SC context with default options
    pub fn establish() -> Result<Self, PcscError> {
        Self::with_config(PcscConfig::default())
    }

    /// Establish a PC/SC context with custom options
    pub fn with_config(config: PcscConfig) -> Result<Self, PcscError> {
        let context = Context::establish(config.scope)?;
        info!(scope = ?config.scope, "PC/SC context established");
        Ok(Self { context, config })
    }

    /// List readers with card presence and ATR
    pub fn list_readers(&self) -> Result<Vec<PcscReader>, PcscError> {
        let names = match self.context.list_readers_owned() {
            Ok(names) => names,
            Err(pcsc::Error::NoReadersAvailable) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reader_states: Vec<ReaderState> = names
            .into_iter()
            .map(|name| ReaderState::new(name, State::UNAWARE))
            .collect();
        if reader_states.is_empty() {
            return Ok(Vec::new());
        }

        match self.context.get_status_change(None, &mut reader_states) {
            Ok(()) => Ok(reader_states
                .iter()
                .map(PcscReader::from_reader_state)
                .collect()),
            Err(e) => {
                // Without a status the readers are still listed, as empty
                warn!(error = %e, "Failed to query reader status");
                Ok(reader_states
                    .iter()
                    .map(|rs| {
                        PcscReader::new(rs.name().to_string_lossy().into_owned(), false, None)
                    })
                    .collect())
            }
        }
    }

    /// Connect to the card in `reader`
    pub fn connect(&self, reader: &str) -> Result<PcscSession, PcscError> {
        let name =
            CString::new(reader).map_err(|_| PcscError::InvalidReaderName(reader.to_owned()))?;
        let card = self
            .context
            .connect(&name, self.config.share_mode.into(), self.config.protocols)
            .map_err(|e| PcscError::connect(reader, e))?;

        debug!(reader, "Connected to card");
        Ok(PcscSession::new(reader, card))
    }

    /// Start a card monitor on its own context in this service's scope
    pub fn monitor(&self) -> Result<CardMonitor, PcscError> {
        CardMonitor::spawn(self.config.scope, self.config.monitor_timeout)
    }
}

impl SmartcardService for PcscService {
    fn readers(&self) -> Result<Vec<ReaderInfo>> {
        Ok(self
            .list_readers()?
            .into_iter()
            .map(ReaderInfo::from)
            .collect())
    }

    fn open_session(&self, reader: &str) -> Result<Box<dyn Session>> {
        Ok(Box::new(self.connect(reader)?))
    }

    fn is_available(&self) -> bool {
        self.context.is_valid().is_ok()
    }

    fn shutdown(&self) {
        info!("PC/SC service shutting down");
        if let Err(e) = self.context.cancel() {
            debug!(error = %e, "No blocking PC/SC call to cancel");
        }
    }
}
