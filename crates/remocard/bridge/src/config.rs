//! Bridge settings
//!
//! Settings are layered with figment: built-in defaults, then the TOML file,
//! then `REMOCARD_*` environment variables, then command line overrides.
//! [`SettingsStore`] hands out immutable snapshots; an update persists the
//! changed keys to the TOML file and reloads the whole stack.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::SettingsRequest;
use crate::error::BridgeError;

/// Default listening port
pub const DEFAULT_PORT: u16 = 33777;

/// Prefix of environment variables overriding settings
pub const ENV_PREFIX: &str = "REMOCARD_";

/// Runtime settings of the bridge
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Listening address
    pub host: IpAddr,
    /// Listening port
    pub port: u16,
    /// Shared secret; empty disables authentication and encryption
    pub password: String,
    /// Close every open channel before opening a new one
    pub single_channel: bool,
    /// Readers remote clients may use; empty allows all
    pub allowed_readers: BTreeSet<String>,
    /// Name reported to clients
    pub device_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            password: String::new(),
            single_channel: false,
            allowed_readers: BTreeSet::new(),
            device_name: "RemoCard".to_owned(),
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &if self.password.is_empty() { "" } else { "<redacted>" })
            .field("single_channel", &self.single_channel)
            .field("allowed_readers", &self.allowed_readers)
            .field("device_name", &self.device_name)
            .finish()
    }
}

impl Settings {
    /// Whether bodies are sealed and callers must authenticate
    pub fn encryption_enabled(&self) -> bool {
        !self.password.is_empty()
    }

    /// Whether remote clients may use `reader`
    pub fn reader_allowed(&self, reader: &str) -> bool {
        self.allowed_readers.is_empty() || self.allowed_readers.contains(reader)
    }

    /// Address to listen on
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Values given on the command line, applied on top of every other source
#[derive(Debug, Clone, Default, Serialize)]
pub struct Overrides {
    /// Listening address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<IpAddr>,
    /// Listening port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Returns the default settings file, `~/.remocard/remocard.toml`
pub fn default_config_path() -> eyre::Result<PathBuf> {
    let home = std::env::home_dir().ok_or_else(|| eyre::eyre!("home directory not found"))?;
    Ok(home.join(".remocard").join("remocard.toml"))
}

/// Load settings from every source
pub fn load(path: &Path, overrides: &Overrides) -> Result<Settings, BridgeError> {
    Figment::from(Serialized::defaults(Settings::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX))
        .merge(Serialized::defaults(overrides))
        .extract()
        .map_err(|e| BridgeError::Settings(e.to_string()))
}

/// Shared, swappable settings snapshot
pub struct SettingsStore {
    path: PathBuf,
    overrides: Overrides,
    current: RwLock<Arc<Settings>>,
    /// Serializes read-modify-write cycles on the file
    update_lock: Mutex<()>,
}

impl fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsStore")
            .field("path", &self.path)
            .field("current", &*self.current.read())
            .finish_non_exhaustive()
    }
}

impl SettingsStore {
    /// Load settings from `path` and the environment
    pub fn load(path: impl Into<PathBuf>, overrides: Overrides) -> Result<Self, BridgeError> {
        let path = path.into();
        let settings = load(&path, &overrides)?;
        Ok(Self::with_settings(path, overrides, settings))
    }

    /// Start from already resolved settings; updates still persist to `path`
    pub fn with_settings(path: impl Into<PathBuf>, overrides: Overrides, settings: Settings) -> Self {
        Self {
            path: path.into(),
            overrides,
            current: RwLock::new(Arc::new(settings)),
            update_lock: Mutex::new(()),
        }
    }

    /// Current settings
    pub fn snapshot(&self) -> Arc<Settings> {
        Arc::clone(&self.current.read())
    }

    /// Settings file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the fields present in `update` and reload
    ///
    /// The listener is not restarted; a new port only takes effect on the
    /// next start.
    pub fn update(&self, update: &SettingsRequest) -> Result<Arc<Settings>, BridgeError> {
        let _guard = self.update_lock.lock();

        let mut document = match fs::read_to_string(&self.path) {
            Ok(text) => text
                .parse::<toml::Table>()
                .map_err(|e| BridgeError::Settings(format!("{}: {e}", self.path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => toml::Table::new(),
            Err(e) => return Err(BridgeError::Settings(e.to_string())),
        };

        if let Some(port) = update.port {
            document.insert("port".into(), toml::Value::Integer(i64::from(port)));
        }
        if let Some(password) = &update.password {
            document.insert("password".into(), toml::Value::String(password.clone()));
        }
        if let Some(single_channel) = update.single_channel {
            document.insert("single_channel".into(), toml::Value::Boolean(single_channel));
        }
        if let Some(readers) = &update.allowed_readers {
            let readers = readers.iter().cloned().map(toml::Value::String).collect();
            document.insert("allowed_readers".into(), toml::Value::Array(readers));
        }

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| BridgeError::Settings(e.to_string()))?;
        }
        let text =
            toml::to_string_pretty(&document).map_err(|e| BridgeError::Settings(e.to_string()))?;
        fs::write(&self.path, text).map_err(|e| BridgeError::Settings(e.to_string()))?;

        let settings = Arc::new(load(&self.path, &self.overrides)?);
        *self.current.write() = Arc::clone(&settings);
        info!(path = %self.path.display(), settings = ?settings, "Settings updated");
        Ok(settings)
    }
}
