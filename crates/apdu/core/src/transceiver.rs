//! Command/response chaining over a single logical channel
//!
//! The transceiver hides two protocol-mandated follow-ups from callers:
//!
//! - `61 xx`: more response data is pending, fetched with GET RESPONSE and
//!   appended until the card reports a terminal status word
//! - `6C xx`: the Le field was wrong, the original command is resent once with
//!   Le corrected to `xx`
//!
//! The returned bytes always end with the terminal status word.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, instrument, trace, warn};

use crate::command::CommandApdu;
use crate::service::Channel;
use crate::status::split_response;
use crate::{Error, Result};

/// Default number of GET RESPONSE frames accepted for one exchange
///
/// 64 frames of 256 bytes cover eUICC profile listings and notification
/// batches.
pub const DEFAULT_MAX_CHAIN: usize = 64;

/// Performs chained exchanges on a channel
#[derive(Debug, Clone, Copy)]
pub struct Transceiver {
    /// Maximum number of chained responses to handle
    pub max_chain: usize,
}

impl Default for Transceiver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHAIN)
    }
}

impl Transceiver {
    /// Create a transceiver with a custom chaining limit
    pub const fn new(max_chain: usize) -> Self {
        Self { max_chain }
    }

    /// Exchange one command, following `61 xx` and `6C xx` as needed
    ///
    /// The caller must hold exclusive access to `channel` for the whole call.
    #[instrument(level = "debug", skip_all, fields(channel = channel.number(), len = command.len()))]
    pub fn exchange(&self, channel: &mut dyn Channel, command: &[u8]) -> Result<Bytes> {
        if command.len() < 4 {
            return Err(Error::InvalidCommand("command shorter than its header"));
        }

        let response = self.exchange_chained(channel, command)?;
        let (status, _) = split_response(&response)?;

        if !status.is_wrong_le() {
            return Ok(response);
        }

        let corrected = correct_le(command, status.sw2);
        debug!(le = status.sw2, "Card reported wrong Le, resending once");

        // A second 6C is handed back to the caller as-is
        self.exchange_chained(channel, &corrected)
    }

    fn exchange_chained(&self, channel: &mut dyn Channel, command: &[u8]) -> Result<Bytes> {
        trace!(command = %hex::encode(command), "Transmitting command");
        let first = channel.transmit(command)?;
        let (mut status, payload) = split_response(&first)?;

        if !status.is_more_data_available() {
            trace!(response = %hex::encode(&first), "Received response");
            return Ok(first);
        }

        let mut buffer = BytesMut::with_capacity(payload.len() + 256);
        buffer.put_slice(payload);

        let mut chain_count = 0;
        while status.is_more_data_available() {
            if chain_count == self.max_chain {
                warn!(max_chain = self.max_chain, "GET RESPONSE chain limit reached");
                return Err(Error::ChainLimitExceeded(self.max_chain));
            }

            // sw2 = 00 asks for 256 bytes, the largest short Le
            let get_response = [0x00, 0xC0, 0x00, 0x00, status.sw2];
            trace!(le = status.sw2, "Sending GET RESPONSE");
            let next = channel.transmit(&get_response)?;
            let (next_status, next_payload) = split_response(&next)?;

            buffer.put_slice(next_payload);
            status = next_status;
            chain_count += 1;
        }

        buffer.put_slice(&status.to_bytes());
        let response = buffer.freeze();
        trace!(
            frames = chain_count + 1,
            response = %hex::encode(&response),
            "Reassembled chained response"
        );
        Ok(response)
    }
}

/// `command` with its Le set to `le`
///
/// A command that does not parse strictly has its last byte replaced, or `le`
/// appended when it is only a header.
fn correct_le(command: &[u8], le: u8) -> Bytes {
    match CommandApdu::parse(command) {
        Ok(apdu) => apdu.with_le(le),
        Err(e) => {
            debug!(error = %e, "Unparsed command, rewriting its last byte as Le");
            let mut corrected = BytesMut::from(command);
            match corrected.len() {
                4 => corrected.put_u8(le),
                len => corrected[len - 1] = le,
            }
            corrected.freeze()
        }
    }
}
