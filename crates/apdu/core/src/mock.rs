//! Scripted in-memory secure element
//!
//! [`MockService`] implements the capability traits without hardware. Each
//! reader holds a set of selectable AIDs and a queue of scripted responses;
//! once the queue is empty every command is answered with `90 00`. Every
//! transmitted frame is recorded so tests can assert on the exact bytes the
//! card saw.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::service::{Channel, ReaderInfo, Session, SmartcardService};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct MockCard {
    present: bool,
    applets: HashSet<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    open_channels: BTreeSet<u8>,
    sessions_opened: usize,
}

#[derive(Debug, Default)]
struct MockState {
    cards: BTreeMap<String, MockCard>,
    shutdown: bool,
    latency: Duration,
}

fn pause(latency: Duration) {
    if !latency.is_zero() {
        std::thread::sleep(latency);
    }
}

/// In-memory [`SmartcardService`] for tests
#[derive(Debug, Clone, Default)]
pub struct MockService {
    state: Arc<Mutex<MockState>>,
}

impl MockService {
    /// Create a service with no readers
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reader with a card present
    pub fn with_reader(self, name: &str) -> Self {
        self.state.lock().cards.insert(
            name.to_owned(),
            MockCard {
                present: true,
                ..MockCard::default()
            },
        );
        self
    }

    /// Add a reader with no card
    pub fn with_empty_reader(self, name: &str) -> Self {
        self.state
            .lock()
            .cards
            .insert(name.to_owned(), MockCard::default());
        self
    }

    /// Make `aid` selectable on the card in `reader`
    pub fn with_applet(self, reader: &str, aid: &[u8]) -> Self {
        if let Some(card) = self.state.lock().cards.get_mut(reader) {
            card.applets.insert(aid.to_vec());
        }
        self
    }

    /// Delay every successful SELECT and transmit by `latency`
    ///
    /// The delay is spent outside the service lock, so concurrent callers
    /// interleave the way they would against real cards.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Queue raw responses (payload + SW) for the card in `reader`
    pub fn with_responses<I, R>(self, reader: &str, responses: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[u8]>,
    {
        self.push_responses(reader, responses);
        self
    }

    /// Queue more raw responses for the card in `reader`
    pub fn push_responses<I, R>(&self, reader: &str, responses: I)
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[u8]>,
    {
        if let Some(card) = self.state.lock().cards.get_mut(reader) {
            card.responses
                .extend(responses.into_iter().map(|r| r.as_ref().to_vec()));
        }
    }

    /// Insert or remove the card in `reader`
    pub fn set_present(&self, reader: &str, present: bool) {
        if let Some(card) = self.state.lock().cards.get_mut(reader) {
            card.present = present;
            if !present {
                card.open_channels.clear();
            }
        }
    }

    /// Frames transmitted to the card in `reader`, in order
    pub fn sent(&self, reader: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .cards
            .get(reader)
            .map(|card| card.sent.clone())
            .unwrap_or_default()
    }

    /// Number of logical channels currently open on the card in `reader`
    pub fn open_channels(&self, reader: &str) -> usize {
        self.state
            .lock()
            .cards
            .get(reader)
            .map_or(0, |card| card.open_channels.len())
    }

    /// Number of sessions ever opened to the card in `reader`
    pub fn sessions_opened(&self, reader: &str) -> usize {
        self.state
            .lock()
            .cards
            .get(reader)
            .map_or(0, |card| card.sessions_opened)
    }

    /// Whether [`SmartcardService::shutdown`] was called
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shutdown
    }
}

impl SmartcardService for MockService {
    fn readers(&self) -> Result<Vec<ReaderInfo>> {
        let state = self.state.lock();
        if state.shutdown {
            return Err(Error::ServiceUnavailable);
        }
        Ok(state
            .cards
            .iter()
            .map(|(name, card)| ReaderInfo::new(name.as_str(), card.present))
            .collect())
    }

    fn open_session(&self, reader: &str) -> Result<Box<dyn Session>> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(Error::ServiceUnavailable);
        }
        let card = state
            .cards
            .get_mut(reader)
            .ok_or_else(|| Error::ReaderNotFound(reader.to_owned()))?;
        if !card.present {
            return Err(Error::NoCard(reader.to_owned()));
        }
        card.sessions_opened += 1;

        Ok(Box::new(MockSession {
            reader: reader.to_owned(),
            state: Arc::clone(&self.state),
            channels: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        }))
    }

    fn shutdown(&self) {
        self.state.lock().shutdown = true;
    }
}

/// Session handed out by [`MockService`]
#[derive(Debug)]
pub struct MockSession {
    reader: String,
    state: Arc<Mutex<MockState>>,
    channels: Mutex<Vec<u8>>,
    closed: Mutex<bool>,
}

impl Session for MockSession {
    fn reader(&self) -> &str {
        &self.reader
    }

    fn open_logical_channel(&self, aid: &[u8]) -> Result<Option<Box<dyn Channel>>> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }

        let mut state = self.state.lock();
        let card = state
            .cards
            .get_mut(&self.reader)
            .ok_or_else(|| Error::ReaderNotFound(self.reader.clone()))?;
        if !card.present {
            return Err(Error::NoCard(self.reader.clone()));
        }
        if !card.applets.contains(aid) {
            return Ok(None);
        }

        let number = (1..=19)
            .find(|n| !card.open_channels.contains(n))
            .ok_or(Error::NoChannelAvailable)?;
        card.open_channels.insert(number);
        self.channels.lock().push(number);
        let latency = state.latency;
        drop(state);
        pause(latency);

        Ok(Some(Box::new(MockChannel {
            reader: self.reader.clone(),
            number,
            state: Arc::clone(&self.state),
        })))
    }

    fn close(&self) -> Result<()> {
        *self.closed.lock() = true;
        let numbers = std::mem::take(&mut *self.channels.lock());
        if let Some(card) = self.state.lock().cards.get_mut(&self.reader) {
            for number in numbers {
                card.open_channels.remove(&number);
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

/// Channel handed out by [`MockSession`]
#[derive(Debug)]
pub struct MockChannel {
    reader: String,
    number: u8,
    state: Arc<Mutex<MockState>>,
}

impl Channel for MockChannel {
    fn transmit(&mut self, command: &[u8]) -> Result<Bytes> {
        let mut state = self.state.lock();
        let card = state
            .cards
            .get_mut(&self.reader)
            .ok_or_else(|| Error::ReaderNotFound(self.reader.clone()))?;
        if !card.open_channels.contains(&self.number) {
            return Err(Error::ChannelClosed);
        }

        card.sent.push(command.to_vec());
        let response = card
            .responses
            .pop_front()
            .unwrap_or_else(|| vec![0x90, 0x00]);
        let latency = state.latency;
        drop(state);
        pause(latency);
        Ok(Bytes::from(response))
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        match state.cards.get_mut(&self.reader) {
            Some(card) => {
                if card.open_channels.remove(&self.number) {
                    Ok(())
                } else {
                    Err(Error::ChannelClosed)
                }
            }
            None => Err(Error::ChannelClosed),
        }
    }

    fn number(&self) -> u8 {
        self.number
    }
}
