//! Selection of the secure element backend at startup

use std::sync::Arc;

use remocard_apdu_core::{SmartcardService, UnavailableService};
use remocard_apdu_transport_pcsc::{CardMonitor, PcscService};
use tracing::{info, warn};

/// The backend in use and, for PC/SC, its card monitor
#[derive(Debug)]
pub struct Backend {
    /// Secure element service
    pub service: Arc<dyn SmartcardService>,
    /// Reader and card event source, when the backend has one
    pub monitor: Option<CardMonitor>,
}

/// Use PC/SC when a context can be established, otherwise a backend without
/// readers so the listener still comes up
pub fn probe() -> Backend {
    match PcscService::establish() {
        Ok(service) => {
            info!("Using PC/SC backend");
            let monitor = service
                .monitor()
                .inspect_err(|e| {
                    warn!(error = %e, "Card monitor unavailable, slots are only detected at startup");
                })
                .ok();
            Backend {
                service: Arc::new(service),
                monitor,
            }
        }
        Err(e) => {
            warn!(error = %e, "PC/SC unavailable, no secure elements will be exposed");
            Backend {
                service: Arc::new(UnavailableService),
                monitor: None,
            }
        }
    }
}
