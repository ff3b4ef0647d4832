//! Handshake and per-session key store

use std::collections::{HashMap, VecDeque};
use std::fmt;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::api::HandshakeResponse;

/// Maximum number of live handshake sessions
pub const SESSION_CAPACITY: usize = 100;

/// Length of the server nonce in characters
const SERVER_NONCE_LEN: usize = 16;

/// A 256-bit symmetric key
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Key derived from the shared secret alone
    pub fn from_password(password: &str) -> Self {
        Self(Sha256::digest(password.as_bytes()).into())
    }

    /// `SHA-256(password || client_nonce || server_nonce)`
    pub fn derive(password: &str, client_nonce: &str, server_nonce: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(client_nonce.as_bytes());
        hasher.update(server_nonce.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Raw key bytes
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey").field("len", &self.0.len()).finish()
    }
}

#[derive(Debug, Default)]
struct Sessions {
    keys: HashMap<String, SessionKey>,
    /// Session ids in insertion order, oldest first
    order: VecDeque<String>,
}

/// Bounded map of handshake session ids to derived keys
///
/// When full, the oldest inserted session is evicted regardless of use.
#[derive(Debug)]
pub struct KeyStore {
    sessions: Mutex<Sessions>,
    capacity: usize,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::with_capacity(SESSION_CAPACITY)
    }
}

impl KeyStore {
    /// Create a store holding at most `capacity` sessions
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(Sessions::default()),
            capacity,
        }
    }

    /// Start a new session keyed from `password` and both nonces
    pub fn handshake(&self, password: &str, client_nonce: &str) -> HandshakeResponse {
        let session_id = Uuid::new_v4().to_string();
        let server_nonce: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(SERVER_NONCE_LEN)
            .collect();
        let key = SessionKey::derive(password, client_nonce, &server_nonce);

        let mut sessions = self.sessions.lock();
        sessions.keys.insert(session_id.clone(), key);
        sessions.order.push_back(session_id.clone());
        while sessions.order.len() > self.capacity {
            if let Some(oldest) = sessions.order.pop_front() {
                sessions.keys.remove(&oldest);
                debug!(session = %oldest, "Evicted handshake session");
            }
        }
        debug!(session = %session_id, live = sessions.keys.len(), "Handshake completed");

        HandshakeResponse {
            session_id,
            server_nonce,
        }
    }

    /// Key for `session_id`, if the session is still live
    pub fn get(&self, session_id: &str) -> Option<SessionKey> {
        self.sessions.lock().keys.get(session_id).cloned()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.lock().keys.len()
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
