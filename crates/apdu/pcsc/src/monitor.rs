//! Background monitor for PC/SC reader and card events

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use pcsc::{Context, ReaderState, Scope, State};
use tracing::{debug, trace, warn};

use crate::error::PcscError;
use crate::event::{CardEvent, EventReceiver, EventSender, PcscEvent, ReaderEvent, event_channel};
use crate::reader::card_present;

/// Handle to a running monitor thread
///
/// The thread stops shortly after the handle is dropped.
pub struct CardMonitor {
    context: Context,
    running: Arc<AtomicBool>,
    receiver: EventReceiver,
}

impl fmt::Debug for CardMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardMonitor")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("pending", &self.receiver.len())
            .finish()
    }
}

impl CardMonitor {
    /// Spawn the monitor thread on a context of its own
    ///
    /// The resource manager serializes calls per context; a dedicated one
    /// keeps status-change waits from stalling card traffic.
    pub(crate) fn spawn(scope: Scope, timeout: Duration) -> Result<Self, PcscError> {
        let context = Context::establish(scope)?;
        let running = Arc::new(AtomicBool::new(true));
        let (sender, receiver) = event_channel();

        let thread_context = context.clone();
        let thread_running = Arc::clone(&running);
        thread::spawn(move || run(&thread_context, &thread_running, &sender, timeout));

        Ok(Self {
            context,
            running,
            receiver,
        })
    }

    /// Receiver for monitor events
    ///
    /// The channel disconnects once the monitor thread has exited.
    pub fn events(&self) -> EventReceiver {
        self.receiver.clone()
    }

    /// Stop the monitor thread
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        // Wake a blocked status-change wait
        let _ = self.context.cancel();
    }
}

impl Drop for CardMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(context: &Context, running: &AtomicBool, sender: &EventSender, timeout: Duration) {
    let pnp = pcsc::PNP_NOTIFICATION();
    let mut tracker = StateTracker::default();
    let mut reader_states = vec![ReaderState::new(pnp, State::UNAWARE)];

    debug!("Card monitor started");
    while running.load(Ordering::Acquire) {
        let names: Vec<String> = match context.list_readers_owned() {
            Ok(readers) => readers
                .iter()
                .map(|r| r.to_string_lossy().into_owned())
                .collect(),
            Err(pcsc::Error::NoReadersAvailable) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Failed to list readers");
                thread::sleep(timeout);
                continue;
            }
        };

        let mut events: Vec<PcscEvent> = tracker
            .update_readers(&names)
            .into_iter()
            .map(PcscEvent::from)
            .collect();

        // Keep the PnP entry and the current state of readers still attached
        reader_states.retain(|rs| {
            rs.name() == pnp || names.iter().any(|n| *n == rs.name().to_string_lossy())
        });
        for name in &names {
            if !reader_states
                .iter()
                .any(|rs| rs.name().to_string_lossy() == name.as_str())
            {
                match std::ffi::CString::new(name.as_str()) {
                    Ok(cname) => reader_states.push(ReaderState::new(cname, State::UNAWARE)),
                    Err(_) => warn!(reader = %name, "Skipping reader with invalid name"),
                }
            }
        }

        match context.get_status_change(Some(timeout), &mut reader_states) {
            Ok(()) => {
                for rs in &mut reader_states {
                    if rs.name() != pnp {
                        let name = rs.name().to_string_lossy().into_owned();
                        let present = card_present(rs.event_state());
                        if let Some(event) = tracker.update_card(&name, present, rs.atr()) {
                            events.push(event.into());
                        }
                    }
                    rs.sync_current_state();
                }
            }
            Err(pcsc::Error::Timeout) => {}
            Err(pcsc::Error::Cancelled) => trace!("Status-change wait cancelled"),
            Err(e) => {
                warn!(error = %e, "Status-change wait failed");
                thread::sleep(timeout);
            }
        }

        for event in events {
            debug!(?event, "PC/SC event");
            if sender.send(event).is_err() {
                debug!("Event receiver dropped, stopping card monitor");
                return;
            }
        }
    }
    debug!("Card monitor stopped");
}

/// Last seen state per reader, used to de-duplicate events
#[derive(Debug, Default)]
struct StateTracker {
    /// Reader name to the ATR of the present card, if any
    readers: HashMap<String, Option<Vec<u8>>>,
}

impl StateTracker {
    fn update_readers(&mut self, current: &[String]) -> Vec<ReaderEvent> {
        let mut events = Vec::new();

        for name in current {
            if !self.readers.contains_key(name) {
                self.readers.insert(name.clone(), None);
                events.push(ReaderEvent::Added(name.clone()));
            }
        }

        let removed: Vec<String> = self
            .readers
            .keys()
            .filter(|name| !current.contains(name))
            .cloned()
            .collect();
        for name in removed {
            self.readers.remove(&name);
            events.push(ReaderEvent::Removed(name));
        }

        events
    }

    fn update_card(&mut self, reader: &str, present: bool, atr: &[u8]) -> Option<CardEvent> {
        let previous = self.readers.get(reader).cloned().flatten();

        match (previous, present) {
            (Some(previous_atr), true) if previous_atr == atr => None,
            (_, true) => {
                self.readers.insert(reader.to_owned(), Some(atr.to_vec()));
                Some(CardEvent::Inserted {
                    reader: reader.to_owned(),
                    atr: atr.to_vec(),
                })
            }
            (Some(_), false) => {
                self.readers.insert(reader.to_owned(), None);
                Some(CardEvent::Removed {
                    reader: reader.to_owned(),
                })
            }
            // Never seen present, nothing to report
            (None, false) => None,
        }
    }
}
