//! Channel and session registry
//!
//! Owns at most one [`Session`] per reader and at most one logical channel per
//! `(reader, AID)` key. Hardware calls are made outside the registry lock;
//! each channel has its own lock, held for a whole chained exchange, so
//! exchanges on one channel are serialized while different channels proceed in
//! parallel.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use remocard_apdu_core::{
    Channel, Error, Result, Session, SmartcardService, Transceiver, decode_hex,
};
use tracing::{debug, info, instrument, warn};

/// Registry key of a logical channel
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelKey {
    reader: String,
    aid: String,
}

impl ChannelKey {
    /// Key for `aid` on `reader`; the AID is normalized to upper-case hex
    /// without whitespace
    pub fn new(reader: impl Into<String>, aid: &str) -> Self {
        Self {
            reader: reader.into(),
            aid: normalize_aid(aid),
        }
    }

    /// Reader name
    pub fn reader(&self) -> &str {
        &self.reader
    }

    /// Normalized AID
    pub fn aid(&self) -> &str {
        &self.aid
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.reader, self.aid)
    }
}

fn normalize_aid(aid: &str) -> String {
    aid.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// A registered logical channel
#[derive(Debug)]
pub struct LiveChannel {
    key: ChannelKey,
    channel: Mutex<Box<dyn Channel>>,
}

impl LiveChannel {
    fn new(key: ChannelKey, channel: Box<dyn Channel>) -> Self {
        Self {
            key,
            channel: Mutex::new(channel),
        }
    }

    /// Registry key of this channel
    pub const fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Run one chained exchange with exclusive use of the channel
    pub fn exchange(&self, transceiver: &Transceiver, command: &[u8]) -> Result<Bytes> {
        let mut channel = self.channel.lock();
        transceiver.exchange(&mut **channel, command)
    }

    fn close(&self) -> Result<()> {
        self.channel.lock().close()
    }
}

#[derive(Debug, Default)]
struct State {
    sessions: HashMap<String, Arc<dyn Session>>,
    channels: BTreeMap<ChannelKey, Arc<LiveChannel>>,
}

/// Live sessions and channels
#[derive(Debug, Default)]
pub struct Registry {
    state: Mutex<State>,
    /// Held across close-all and open in single-channel mode
    exclusive: Mutex<()>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Session for `reader`, opening one if none is live
    #[instrument(level = "debug", skip(self, service))]
    pub fn session(&self, service: &dyn SmartcardService, reader: &str) -> Result<Arc<dyn Session>> {
        {
            let mut state = self.state.lock();
            match state.sessions.get(reader) {
                Some(session) if !session.is_closed() => return Ok(Arc::clone(session)),
                Some(_) => {
                    debug!(%reader, "Dropping closed session");
                    state.sessions.remove(reader);
                }
                None => {}
            }
        }

        let opened: Arc<dyn Session> = Arc::from(service.open_session(reader)?);

        let mut state = self.state.lock();
        let existing = state
            .sessions
            .get(reader)
            .filter(|s| !s.is_closed())
            .cloned();
        if let Some(existing) = existing {
            // Another request won the race
            drop(state);
            if let Err(e) = opened.close() {
                debug!(%reader, error = %e, "Failed to close surplus session");
            }
            return Ok(existing);
        }
        state.sessions.insert(reader.to_owned(), Arc::clone(&opened));
        info!(%reader, "Session opened");
        Ok(opened)
    }

    /// Open a channel to the first of `aids` the card in `reader` accepts
    ///
    /// Returns the accepted AID as given by the caller, or `None` when every
    /// candidate was rejected. An existing channel under the same key is
    /// replaced and closed.
    #[instrument(level = "debug", skip(self, service))]
    pub fn open_channel(
        &self,
        service: &dyn SmartcardService,
        reader: &str,
        aids: &[String],
    ) -> Result<Option<String>> {
        let candidates = parse_candidates(aids)?;
        self.open_first(service, reader, &candidates)
    }

    /// Close every channel and session, then open a channel as
    /// [`Registry::open_channel`] does
    ///
    /// Concurrent calls are serialized, so at most one channel is registered
    /// once every call has returned. Malformed AIDs are rejected before
    /// anything is closed.
    #[instrument(level = "debug", skip(self, service))]
    pub fn replace_all(
        &self,
        service: &dyn SmartcardService,
        reader: &str,
        aids: &[String],
    ) -> Result<Option<String>> {
        let candidates = parse_candidates(aids)?;

        let _exclusive = self.exclusive.lock();
        self.close_all();
        self.open_first(service, reader, &candidates)
    }

    fn open_first(
        &self,
        service: &dyn SmartcardService,
        reader: &str,
        candidates: &[(&String, Vec<u8>)],
    ) -> Result<Option<String>> {
        let session = self.session(service, reader)?;
        for &(aid, ref bytes) in candidates {
            match session.open_logical_channel(bytes) {
                Ok(Some(channel)) => {
                    let key = ChannelKey::new(reader, aid);
                    info!(%key, channel = channel.number(), "Channel opened");
                    self.register(key, channel);
                    return Ok(Some(aid.clone()));
                }
                Ok(None) => debug!(%reader, %aid, "AID not selectable"),
                Err(Error::SessionClosed) => {
                    self.evict_session(reader, &session);
                    return Err(Error::SessionClosed);
                }
                Err(e) => warn!(%reader, %aid, error = %e, "Failed to open channel"),
            }
        }
        Ok(None)
    }

    fn register(&self, key: ChannelKey, channel: Box<dyn Channel>) {
        let live = Arc::new(LiveChannel::new(key.clone(), channel));
        let displaced = self.state.lock().channels.insert(key, live);
        if let Some(old) = displaced {
            debug!(key = %old.key, "Closing displaced channel");
            if let Err(e) = old.close() {
                debug!(key = %old.key, error = %e, "Failed to close displaced channel");
            }
        }
    }

    fn evict_session(&self, reader: &str, stale: &Arc<dyn Session>) {
        let mut state = self.state.lock();
        if state
            .sessions
            .get(reader)
            .is_some_and(|s| Arc::ptr_eq(s, stale))
        {
            state.sessions.remove(reader);
            warn!(%reader, "Evicted closed session");
        }
    }

    /// Channel registered under `key`
    pub fn channel(&self, key: &ChannelKey) -> Option<Arc<LiveChannel>> {
        self.state.lock().channels.get(key).cloned()
    }

    /// Close and unregister the channel under `key`
    ///
    /// Returns whether a channel was registered. Close failures are logged
    /// and otherwise ignored.
    #[instrument(level = "debug", skip_all, fields(%key))]
    pub fn close_channel(&self, key: &ChannelKey) -> bool {
        let removed = self.state.lock().channels.remove(key);
        match removed {
            Some(channel) => {
                if let Err(e) = channel.close() {
                    warn!(%key, error = %e, "Failed to close channel");
                }
                info!(%key, "Channel closed");
                true
            }
            None => false,
        }
    }

    /// Close every channel, then every session
    ///
    /// Individual failures are logged and skipped; both maps are empty
    /// afterwards.
    #[instrument(level = "debug", skip(self))]
    pub fn close_all(&self) {
        let State { sessions, channels } = std::mem::take(&mut *self.state.lock());
        if channels.is_empty() && sessions.is_empty() {
            return;
        }

        let mut failures = 0usize;
        for (key, channel) in &channels {
            if let Err(e) = channel.close() {
                failures += 1;
                debug!(%key, error = %e, "Failed to close channel");
            }
        }
        for (reader, session) in &sessions {
            if let Err(e) = session.close() {
                failures += 1;
                debug!(%reader, error = %e, "Failed to close session");
            }
        }
        info!(
            channels = channels.len(),
            sessions = sessions.len(),
            failures,
            "Closed all channels and sessions"
        );
    }

    /// Keys of all registered channels, sorted
    pub fn channel_keys(&self) -> Vec<ChannelKey> {
        self.state.lock().channels.keys().cloned().collect()
    }
}

fn parse_candidates(aids: &[String]) -> Result<Vec<(&String, Vec<u8>)>> {
    aids.iter()
        .map(|aid| decode_hex(aid).map(|bytes| (aid, bytes)))
        .collect()
}

/// Exchange `command` on a throw-away session and channel to `aid`
///
/// Returns `None` when the card refuses the AID. Both handles are closed
/// before returning, failures to do so are only logged.
#[instrument(level = "debug", skip(service, transceiver, command))]
pub fn exchange_once(
    service: &dyn SmartcardService,
    transceiver: &Transceiver,
    reader: &str,
    aid: &[u8],
    command: &[u8],
) -> Result<Option<Bytes>> {
    let session = service.open_session(reader)?;
    let result = match session.open_logical_channel(aid) {
        Ok(Some(mut channel)) => {
            let response = transceiver.exchange(channel.as_mut(), command);
            if let Err(e) = channel.close() {
                debug!(%reader, error = %e, "Failed to close ad-hoc channel");
            }
            response.map(Some)
        }
        Ok(None) => Ok(None),
        Err(e) => Err(e),
    };
    if let Err(e) = session.close() {
        debug!(%reader, error = %e, "Failed to close ad-hoc session");
    }
    result
}
