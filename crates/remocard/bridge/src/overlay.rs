//! Encrypted transport overlay
//!
//! With a password configured, request and response bodies travel as
//! `base64(IV || AES-256-CBC(PKCS#7, body))`. The key is the handshake session
//! key when the caller names a session, otherwise `SHA-256(password)`. Without a
//! password bodies pass through untouched.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::config::Settings;
use crate::handshake::{KeyStore, SessionKey};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

/// Response extension marking a body that must not be sealed
#[derive(Clone, Copy, Debug)]
pub struct Plaintext;

/// Overlay failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OverlayError {
    /// Session header names no live handshake session
    #[error("Invalid session")]
    InvalidSession,

    /// Body is not valid base64
    #[error("Invalid base64: {0}")]
    Base64(String),

    /// Body is shorter than an IV
    #[error("Ciphertext too short")]
    TooShort,

    /// Wrong key or corrupted ciphertext
    #[error("Invalid padding")]
    Padding,

    /// Key or IV of the wrong length
    #[error("Invalid key length")]
    KeyLength,
}

/// Wraps and unwraps bodies for one request
#[derive(Debug, Clone, Copy)]
pub struct Overlay<'a> {
    settings: &'a Settings,
    keys: &'a KeyStore,
}

impl<'a> Overlay<'a> {
    /// Overlay using the current settings and handshake sessions
    pub const fn new(settings: &'a Settings, keys: &'a KeyStore) -> Self {
        Self { settings, keys }
    }

    /// Whether bodies are transformed at all
    pub fn is_active(&self) -> bool {
        self.settings.encryption_enabled()
    }

    fn key(&self, session: Option<&str>) -> Result<SessionKey, OverlayError> {
        match session {
            Some(id) => self.keys.get(id).ok_or(OverlayError::InvalidSession),
            None => Ok(SessionKey::from_password(&self.settings.password)),
        }
    }

    /// Seal an outgoing body
    pub fn wrap(&self, session: Option<&str>, plaintext: &[u8]) -> Result<Bytes, OverlayError> {
        if !self.is_active() {
            return Ok(Bytes::copy_from_slice(plaintext));
        }
        let key = self.key(session)?;
        Ok(Bytes::from(encrypt(&key, plaintext)?))
    }

    /// Open an incoming body
    pub fn unwrap(&self, session: Option<&str>, body: &[u8]) -> Result<Vec<u8>, OverlayError> {
        if !self.is_active() {
            return Ok(body.to_vec());
        }
        let key = self.key(session)?;
        decrypt(&key, body)
    }
}

/// `base64(IV || ciphertext)` with a fresh random IV
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Result<String, OverlayError> {
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new_from_slices(key.as_bytes(), &iv)
        .map_err(|_| OverlayError::KeyLength)?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut sealed = Vec::with_capacity(IV_LEN + ciphertext.len());
    sealed.extend_from_slice(&iv);
    sealed.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(sealed))
}

/// Reverse of [`encrypt`]; surrounding whitespace in `body` is ignored
pub fn decrypt(key: &SessionKey, body: &[u8]) -> Result<Vec<u8>, OverlayError> {
    let text: Vec<u8> = body
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let sealed = STANDARD
        .decode(text)
        .map_err(|e| OverlayError::Base64(e.to_string()))?;
    if sealed.len() < IV_LEN {
        return Err(OverlayError::TooShort);
    }
    let (iv, ciphertext) = sealed.split_at(IV_LEN);

    Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| OverlayError::KeyLength)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| OverlayError::Padding)
}
