//! Event types reported by the card monitor

use crossbeam_channel::{Receiver, Sender, unbounded};

/// Events related to card insertion/removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardEvent {
    /// Card was inserted into a reader
    Inserted {
        /// Reader name
        reader: String,
        /// ATR of the inserted card
        atr: Vec<u8>,
    },
    /// Card was removed from a reader
    Removed {
        /// Reader name
        reader: String,
    },
}

/// Events related to reader connection/disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// Reader was connected to the system
    Added(String),
    /// Reader was disconnected from the system
    Removed(String),
}

/// Any event emitted by the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PcscEvent {
    /// Card state change
    Card(CardEvent),
    /// Reader list change
    Reader(ReaderEvent),
}

impl PcscEvent {
    /// Name of the reader the event concerns
    pub fn reader(&self) -> &str {
        match self {
            Self::Card(CardEvent::Inserted { reader, .. } | CardEvent::Removed { reader })
            | Self::Reader(ReaderEvent::Added(reader) | ReaderEvent::Removed(reader)) => reader,
        }
    }
}

impl From<CardEvent> for PcscEvent {
    fn from(event: CardEvent) -> Self {
        Self::Card(event)
    }
}

impl From<ReaderEvent> for PcscEvent {
    fn from(event: ReaderEvent) -> Self {
        Self::Reader(event)
    }
}

/// Sender for monitor events
pub type EventSender = Sender<PcscEvent>;
/// Receiver for monitor events
pub type EventReceiver = Receiver<PcscEvent>;

/// Create an unbounded channel for monitor events
pub fn event_channel() -> (EventSender, EventReceiver) {
    unbounded()
}
