//! Error types for the PC/SC backend

use remocard_apdu_core::Error;

/// PC/SC-specific errors
#[derive(Debug, thiserror::Error)]
pub enum PcscError {
    /// PC/SC error
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    /// Reader not found
    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    /// No card present in reader
    #[error("No card present in reader: {0}")]
    NoCard(String),

    /// Card was removed or reset, invalidating the connection
    #[error("Card in reader {0} was removed or reset")]
    CardRemoved(String),

    /// Reader name cannot be passed to PC/SC
    #[error("Invalid reader name: {0:?}")]
    InvalidReaderName(String),
}

impl PcscError {
    /// Map a connect failure to the most specific variant for `reader`
    pub(crate) fn connect(reader: &str, error: pcsc::Error) -> Self {
        match error {
            pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard => Self::NoCard(reader.to_owned()),
            pcsc::Error::UnknownReader | pcsc::Error::ReaderUnavailable => {
                Self::ReaderNotFound(reader.to_owned())
            }
            other => Self::Pcsc(other),
        }
    }

    /// Map a transmit failure for `reader`
    pub(crate) fn transmit(reader: &str, error: pcsc::Error) -> Self {
        match error {
            pcsc::Error::RemovedCard | pcsc::Error::ResetCard => {
                Self::CardRemoved(reader.to_owned())
            }
            other => Self::Pcsc(other),
        }
    }
}

impl From<PcscError> for Error {
    fn from(error: PcscError) -> Self {
        match error {
            PcscError::ReaderNotFound(reader) => Self::ReaderNotFound(reader),
            PcscError::NoCard(reader) => Self::NoCard(reader),
            PcscError::Pcsc(pcsc::Error::NoService | pcsc::Error::ServiceStopped) => {
                Self::ServiceUnavailable
            }
            other => Self::transport(other),
        }
    }
}
