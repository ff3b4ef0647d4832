//! Card sessions and ISO/IEC 7816-4 logical channels over PC/SC

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use pcsc::{Card, Disposition};
use remocard_apdu_core::command::with_channel;
use remocard_apdu_core::status::split_response;
use remocard_apdu_core::{Channel, Error, Result, Session, Transceiver};
use tracing::{debug, trace, warn};

use crate::error::PcscError;

const MANAGE_CHANNEL_OPEN: [u8; 5] = [0x00, 0x70, 0x00, 0x00, 0x01];

/// The card handle and the receive buffer reused by every transmit
struct Link {
    card: Option<Card>,
    buffer: Vec<u8>,
}

/// Connection state shared by a session and the channels opened through it
struct Connection {
    reader: String,
    link: Mutex<Link>,
    basic_in_use: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("reader", &self.reader)
            .field("connected", &self.is_connected())
            .field("basic_in_use", &self.basic_in_use.load(Ordering::Relaxed))
            .finish()
    }
}

impl Connection {
    /// Transmit one raw frame
    ///
    /// A removed or reset card drops the connection; every later call fails.
    fn transmit(&self, command: &[u8]) -> Result<Bytes> {
        let mut guard = self.link.lock();
        let Link { card, buffer } = &mut *guard;
        let connected = card.as_ref().ok_or(Error::SessionClosed)?;

        trace!(reader = %self.reader, command = %hex::encode(command), "PC/SC transmit");
        match connected.transmit(command, buffer.as_mut_slice()) {
            Ok(response) => {
                trace!(reader = %self.reader, response = %hex::encode(response), "PC/SC response");
                Ok(Bytes::copy_from_slice(response))
            }
            Err(e) => {
                let error = PcscError::transmit(&self.reader, e);
                if matches!(error, PcscError::CardRemoved(_)) {
                    warn!(reader = %self.reader, "Card removed or reset, dropping connection");
                    *card = None;
                }
                Err(error.into())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.link.lock().card.is_some()
    }

    fn disconnect(&self) -> Result<()> {
        match self.link.lock().card.take() {
            Some(card) => card
                .disconnect(Disposition::LeaveCard)
                .map_err(|(_, e)| Error::from(PcscError::Pcsc(e))),
            None => Ok(()),
        }
    }
}

/// A shared-mode connection to the card in one reader
#[derive(Debug)]
pub struct PcscSession {
    connection: Arc<Connection>,
}

impl PcscSession {
    pub(crate) fn new(reader: &str, card: Card) -> Self {
        Self {
            connection: Arc::new(Connection {
                reader: reader.to_owned(),
                link: Mutex::new(Link {
                    card: Some(card),
                    buffer: vec![0u8; pcsc::MAX_BUFFER_SIZE_EXTENDED],
                }),
                basic_in_use: AtomicBool::new(false),
            }),
        }
    }

    /// Obtain a channel number, falling back to the basic channel when the
    /// card has no logical channel support
    fn allocate_channel(&self) -> Result<u8> {
        let response = self.connection.transmit(&MANAGE_CHANNEL_OPEN)?;
        let (status, payload) = split_response(&response)?;

        match payload {
            [number] if status.is_success() => Ok(*number),
            _ if status.is_logical_channel_unsupported() => {
                if self
                    .connection
                    .basic_in_use
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    debug!(reader = %self.connection.reader, "Logical channels unsupported, using basic channel");
                    Ok(0)
                } else {
                    Err(Error::NoChannelAvailable)
                }
            }
            _ if status.sw1 == 0x6A && status.sw2 == 0x81 => Err(Error::NoChannelAvailable),
            _ => Err(Error::UnexpectedStatus { status }),
        }
    }
}

impl Session for PcscSession {
    fn reader(&self) -> &str {
        &self.connection.reader
    }

    fn open_logical_channel(&self, aid: &[u8]) -> Result<Option<Box<dyn Channel>>> {
        let lc = u8::try_from(aid.len()).map_err(|_| Error::InvalidCommand("AID too long"))?;
        let number = self.allocate_channel()?;
        let mut channel = PcscChannel {
            connection: Arc::clone(&self.connection),
            number,
            closed: false,
        };

        let mut select = Vec::with_capacity(aid.len() + 6);
        select.extend_from_slice(&[0x00, 0xA4, 0x04, 0x00, lc]);
        select.extend_from_slice(aid);
        select.push(0x00);

        // 61xx is drained by the transceiver, leaving the terminal status
        let response = Transceiver::default().exchange(&mut channel, &select)?;
        let (status, _) = split_response(&response)?;

        if status.is_success() {
            debug!(
                reader = %self.connection.reader,
                channel = number,
                aid = %hex::encode_upper(aid),
                "Application selected"
            );
            return Ok(Some(Box::new(channel)));
        }

        debug!(
            reader = %self.connection.reader,
            aid = %hex::encode_upper(aid),
            %status,
            "Application rejected selection"
        );
        if let Err(e) = channel.close() {
            warn!(reader = %self.connection.reader, error = %e, "Failed to close rejected channel");
        }
        Ok(None)
    }

    fn close(&self) -> Result<()> {
        debug!(reader = %self.connection.reader, "Disconnecting card");
        self.connection.disconnect()
    }

    fn is_closed(&self) -> bool {
        !self.connection.is_connected()
    }
}

impl Drop for PcscSession {
    fn drop(&mut self) {
        let _ = self.connection.disconnect();
    }
}

/// A logical channel on a [`PcscSession`]
#[derive(Debug)]
pub struct PcscChannel {
    connection: Arc<Connection>,
    number: u8,
    closed: bool,
}

impl Channel for PcscChannel {
    fn transmit(&mut self, command: &[u8]) -> Result<Bytes> {
        if self.closed {
            return Err(Error::ChannelClosed);
        }

        match command.split_first() {
            Some((&cla, rest)) if self.number != 0 => {
                let mut framed = Vec::with_capacity(command.len());
                framed.push(with_channel(cla, self.number));
                framed.extend_from_slice(rest);
                self.connection.transmit(&framed)
            }
            _ => self.connection.transmit(command),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.number == 0 {
            self.connection.basic_in_use.store(false, Ordering::Release);
            return Ok(());
        }

        let response = self
            .connection
            .transmit(&[0x00, 0x70, 0x80, self.number])?;
        let (status, _) = split_response(&response)?;
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::UnexpectedStatus { status })
        }
    }

    fn number(&self) -> u8 {
        self.number
    }
}

impl Drop for PcscChannel {
    fn drop(&mut self) {
        // Channels on a disconnected card are already gone
        if !self.closed && self.connection.is_connected() {
            let _ = self.close();
        }
    }
}
