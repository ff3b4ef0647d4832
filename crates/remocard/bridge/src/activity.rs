//! Last-seen tracking of remote clients

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

/// Entries not refreshed within this window are dropped
pub const ACTIVITY_TTL: Duration = Duration::from_secs(10 * 60);

/// Client address to last request time
#[derive(Debug)]
pub struct ClientActivity {
    clients: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl Default for ClientActivity {
    fn default() -> Self {
        Self::with_ttl(ACTIVITY_TTL)
    }
}

impl ClientActivity {
    /// Tracker forgetting clients after `ttl`
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record a request from `client` and sweep stale entries
    pub fn touch(&self, client: &str) {
        self.touch_at(client, Instant::now());
    }

    fn touch_at(&self, client: &str, now: Instant) {
        let mut clients = self.clients.lock();
        if clients.insert(client.to_owned(), now).is_none() {
            debug!(%client, "New client");
        }

        let ttl = self.ttl;
        let before = clients.len();
        clients.retain(|_, seen| now.saturating_duration_since(*seen) <= ttl);
        if clients.len() < before {
            trace!(expired = before - clients.len(), "Swept idle clients");
        }
    }

    /// Clients seen within the window
    pub fn active(&self) -> Vec<String> {
        let mut clients: Vec<String> = self.clients.lock().keys().cloned().collect();
        clients.sort();
        clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_records_client() {
        let activity = ClientActivity::default();
        activity.touch("10.0.0.1");
        activity.touch("10.0.0.1");
        activity.touch("10.0.0.2");
        assert_eq!(activity.active(), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_stale_entries_are_swept() {
        let activity = ClientActivity::with_ttl(Duration::from_secs(60));
        let start = Instant::now();

        activity.touch_at("old", start);
        activity.touch_at("recent", start + Duration::from_secs(50));
        activity.touch_at("new", start + Duration::from_secs(90));

        assert_eq!(activity.active(), vec!["new", "recent"]);
    }
}
