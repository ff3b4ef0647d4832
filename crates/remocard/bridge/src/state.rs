//! Shared state handed to every request

use std::sync::Arc;

use remocard_apdu_core::{SmartcardService, Transceiver};

use crate::activity::ClientActivity;
use crate::config::{Settings, SettingsStore};
use crate::handshake::KeyStore;
use crate::overlay::Overlay;
use crate::registry::Registry;
use crate::slots::SlotDirectory;

/// Application state, cheap to clone
#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    service: Arc<dyn SmartcardService>,
    registry: Registry,
    keys: KeyStore,
    settings: SettingsStore,
    activity: ClientActivity,
    slots: SlotDirectory,
    transceiver: Transceiver,
}

impl AppState {
    /// State over `service` with the given settings
    pub fn new(service: Arc<dyn SmartcardService>, settings: SettingsStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                service,
                registry: Registry::new(),
                keys: KeyStore::default(),
                settings,
                activity: ClientActivity::default(),
                slots: SlotDirectory::new(),
                transceiver: Transceiver::default(),
            }),
        }
    }

    /// Secure element backend
    pub fn service(&self) -> &dyn SmartcardService {
        self.inner.service.as_ref()
    }

    /// Open sessions and channels
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Handshake sessions
    pub fn keys(&self) -> &KeyStore {
        &self.inner.keys
    }

    /// Settings store
    pub fn settings(&self) -> &SettingsStore {
        &self.inner.settings
    }

    /// Client last-seen tracking
    pub fn activity(&self) -> &ClientActivity {
        &self.inner.activity
    }

    /// Slot detection results
    pub fn slots(&self) -> &SlotDirectory {
        &self.inner.slots
    }

    /// Chaining policy for exchanges
    pub fn transceiver(&self) -> &Transceiver {
        &self.inner.transceiver
    }

    /// Overlay bound to `settings` and this state's handshake sessions
    pub fn overlay<'a>(&'a self, settings: &'a Settings) -> Overlay<'a> {
        Overlay::new(settings, &self.inner.keys)
    }

    /// Re-run slot detection
    pub fn refresh_slots(&self) {
        self.inner
            .slots
            .refresh(self.inner.service.as_ref(), &self.inner.transceiver);
    }

    /// Close every channel and session, then release the backend
    pub fn shutdown(&self) {
        self.inner.registry.close_all();
        self.inner.service.shutdown();
    }
}
