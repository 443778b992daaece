//! Configuration for huelink applications.
//!
//! Bridge credential files, application-key resolution (env + keyring +
//! file), TOML/env settings, and translation to `huelink_core::HubConfig`.
//! Also owns the process-wide registry of stored bridges.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use directories::{BaseDirs, ProjectDirs};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use huelink_core::{BridgeCredentials, CoreError, Hub, HubConfig, TlsVerification};

const KEYRING_SERVICE: &str = "huelink";
const ENV_PREFIX: &str = "HUELINK_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("can't read credential file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("no credentials stored for bridge '{hostname}'")]
    NoCredentials { hostname: String },

    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── Credential file ─────────────────────────────────────────────────

/// The JSON credential file: one record per bridge, keyed by host.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthFile {
    #[serde(default)]
    pub records: BTreeMap<String, AuthRecord>,
}

/// One bridge as recorded at pairing time.
///
/// Older files use `ip` and `username`; newer ones `hostname` and
/// `application_key`. Either spelling is accepted.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthRecord {
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub application_key: Option<String>,
    pub username: Option<String>,
    /// Bridge id.
    pub id: Option<String>,
}

impl AuthRecord {
    pub fn host(&self) -> Option<&str> {
        self.hostname.as_deref().or(self.ip.as_deref())
    }

    /// Plaintext key (`application_key`, else `username`).
    pub fn key(&self) -> Option<&str> {
        self.application_key.as_deref().or(self.username.as_deref())
    }
}

/// `~/hue-auth`.
pub fn default_authfile_path() -> PathBuf {
    BaseDirs::new().map_or_else(
        || PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into())),
        |dirs| dirs.home_dir().to_path_buf(),
    )
    .join("hue-auth")
}

/// Read and parse a credential file. A missing file reads as empty.
pub fn load_authfile(path: &Path) -> Result<AuthFile, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no credential file");
            return Ok(AuthFile::default());
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a credential file, creating parent directories as needed.
pub fn save_authfile(path: &Path, file: &AuthFile) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(file).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, json)?;
    Ok(())
}

// ── Application-key resolution ──────────────────────────────────────

/// Environment variable consulted for `hostname`'s key, e.g.
/// `HUELINK_KEY_192_168_1_20`.
pub fn key_env_var(hostname: &str) -> String {
    let host: String = hostname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{ENV_PREFIX}KEY_{host}")
}

/// Resolve a bridge's application key.
///
/// 1. `HUELINK_KEY_<HOST>` environment variable
/// 2. System keyring (`huelink` / `<host>/application-key`)
/// 3. Plaintext in the credential record
pub fn resolve_application_key(
    hostname: &str,
    record: Option<&AuthRecord>,
) -> Result<SecretString, ConfigError> {
    if let Ok(val) = std::env::var(key_env_var(hostname)) {
        return Ok(SecretString::from(val));
    }

    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &format!("{hostname}/application-key")) {
        if let Ok(secret) = entry.get_password() {
            return Ok(SecretString::from(secret));
        }
    }

    if let Some(key) = record.and_then(AuthRecord::key) {
        return Ok(SecretString::from(key.to_owned()));
    }

    Err(ConfigError::NoCredentials {
        hostname: hostname.into(),
    })
}

/// Store a bridge's application key in the system keyring.
pub fn store_application_key(hostname: &str, key: &str) -> Result<(), ConfigError> {
    let keyring_error = |e: keyring::Error| ConfigError::Validation {
        field: "keyring".into(),
        reason: e.to_string(),
    };
    keyring::Entry::new(KEYRING_SERVICE, &format!("{hostname}/application-key"))
        .and_then(|entry| entry.set_password(key))
        .map_err(keyring_error)
}

/// Credentials for every usable record in `file`, keyed by host.
///
/// Records without a host or without any resolvable key are skipped.
pub fn credentials_from(file: &AuthFile) -> BTreeMap<String, BridgeCredentials> {
    let mut hubs = BTreeMap::new();
    for (name, record) in &file.records {
        let Some(host) = record.host() else {
            tracing::warn!(record = %name, "credential record has no hostname, skipping");
            continue;
        };
        let key = match resolve_application_key(host, Some(record)) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(hostname = host, error = %e, "skipping bridge");
                continue;
            }
        };
        let mut credentials = BridgeCredentials::new(host, key);
        if let Some(id) = &record.id {
            credentials = credentials.with_bridge_id(id.clone());
        }
        hubs.insert(host.to_owned(), credentials);
    }
    hubs
}

/// Load credentials for every bridge in the file at `path`.
pub fn load_credentials(path: &Path) -> Result<BTreeMap<String, BridgeCredentials>, ConfigError> {
    Ok(credentials_from(&load_authfile(path)?))
}

// ── Stored bridges ──────────────────────────────────────────────────

static STORED: OnceLock<BTreeMap<String, BridgeCredentials>> = OnceLock::new();

/// Initialize the stored-bridge registry from `path` (default
/// [`default_authfile_path`]). Later calls return the first result.
pub fn init_stored(
    path: Option<&Path>,
) -> Result<&'static BTreeMap<String, BridgeCredentials>, ConfigError> {
    if let Some(stored) = STORED.get() {
        return Ok(stored);
    }
    let path = path.map_or_else(default_authfile_path, Path::to_path_buf);
    let loaded = load_credentials(&path)?;
    tracing::debug!(path = %path.display(), bridges = loaded.len(), "loaded stored bridges");
    Ok(STORED.get_or_init(|| loaded))
}

/// The stored-bridge registry, loading the default file on first use.
///
/// An unreadable file is logged and treated as empty.
pub fn stored() -> &'static BTreeMap<String, BridgeCredentials> {
    match init_stored(None) {
        Ok(stored) => stored,
        Err(e) => {
            tracing::error!(error = %e, "can't load stored bridges");
            STORED.get_or_init(BTreeMap::new)
        }
    }
}

/// Stored credentials for `hostname`.
pub fn named(hostname: &str) -> Option<BridgeCredentials> {
    stored().get(hostname).cloned()
}

/// A hub for the stored bridge `hostname`, configured from `settings`.
pub fn hub_named(hostname: &str, settings: &Settings) -> Result<Hub, ConfigError> {
    let credentials = named(hostname).ok_or_else(|| ConfigError::NoCredentials {
        hostname: hostname.into(),
    })?;
    Ok(Hub::new(credentials, settings.to_hub_config()?)?)
}

// ── Settings ────────────────────────────────────────────────────────

/// Tuning loaded from `settings.toml` and `HUELINK_*` variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Credential file; defaults to `~/hue-auth`.
    pub authfile: Option<PathBuf>,
    /// Bridge used when none is named.
    pub default_bridge: Option<String>,
    /// Overrides `https://<hostname>`.
    pub base_url: Option<String>,
    /// Skip TLS verification (bridges use self-signed certificates).
    pub insecure: bool,
    pub ca_cert: Option<PathBuf>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub ignorable_error: String,
    pub refresh_interval_secs: u64,
    pub refresh_retry_delay_secs: u64,
    pub tick_interval_ms: u64,
    pub stale_refresh_threshold: usize,
    pub reconnect_interval_secs: u64,
    pub default_duration_ms: u64,
    pub long_press_threshold_ms: u64,
    pub button_stale_after_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl From<&HubConfig> for Settings {
    fn from(config: &HubConfig) -> Self {
        Self {
            authfile: None,
            default_bridge: None,
            base_url: config.base_url.as_ref().map(ToString::to_string),
            insecure: config.tls == TlsVerification::DangerAcceptInvalid,
            ca_cert: match &config.tls {
                TlsVerification::CustomCa(path) => Some(path.clone()),
                _ => None,
            },
            timeout_secs: config.timeout.as_secs(),
            max_retries: config.max_retries,
            retry_delay_ms: millis(config.retry_delay),
            ignorable_error: config.ignorable_error.clone(),
            refresh_interval_secs: config.refresh_interval.as_secs(),
            refresh_retry_delay_secs: config.refresh_retry_delay.as_secs(),
            tick_interval_ms: millis(config.tick_interval),
            stale_refresh_threshold: config.stale_refresh_threshold,
            reconnect_interval_secs: config.reconnect_interval.as_secs(),
            default_duration_ms: millis(config.default_duration),
            long_press_threshold_ms: millis(config.long_press_threshold),
            button_stale_after_ms: millis(config.button_stale_after),
        }
    }
}

impl Settings {
    /// The credential file these settings point at.
    pub fn authfile_path(&self) -> PathBuf {
        self.authfile.clone().unwrap_or_else(default_authfile_path)
    }

    /// Build a `HubConfig`, rejecting values the hub can't run with.
    pub fn to_hub_config(&self) -> Result<HubConfig, ConfigError> {
        let base_url = self
            .base_url
            .as_deref()
            .map(|raw| {
                raw.parse::<url::Url>().map_err(|_| ConfigError::Validation {
                    field: "base_url".into(),
                    reason: format!("invalid URL: {raw}"),
                })
            })
            .transpose()?;

        if self.max_retries == 0 {
            return Err(ConfigError::Validation {
                field: "max_retries".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Validation {
                field: "tick_interval_ms".into(),
                reason: "must be greater than zero".into(),
            });
        }

        let tls = if let Some(path) = &self.ca_cert {
            TlsVerification::CustomCa(path.clone())
        } else if self.insecure {
            TlsVerification::DangerAcceptInvalid
        } else {
            TlsVerification::SystemDefaults
        };

        Ok(HubConfig {
            base_url,
            tls,
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            ignorable_error: self.ignorable_error.clone(),
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            refresh_retry_delay: Duration::from_secs(self.refresh_retry_delay_secs),
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            stale_refresh_threshold: self.stale_refresh_threshold,
            reconnect_interval: Duration::from_secs(self.reconnect_interval_secs),
            default_duration: Duration::from_millis(self.default_duration_ms),
            long_press_threshold: Duration::from_millis(self.long_press_threshold_ms),
            button_stale_after: Duration::from_millis(self.button_stale_after_ms),
        })
    }
}

/// Resolve the settings file path via XDG / platform conventions.
pub fn settings_path() -> PathBuf {
    ProjectDirs::from("com", "huelink", "huelink").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("huelink");
            p.push("settings.toml");
            p
        },
        |dirs| dirs.config_dir().join("settings.toml"),
    )
}

/// Load settings: defaults, then `path`, then `HUELINK_*` variables.
pub fn load_settings_from(path: &Path) -> Result<Settings, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Settings::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX));

    Ok(figment.extract()?)
}

/// Load settings from the canonical path.
pub fn load_settings() -> Result<Settings, ConfigError> {
    load_settings_from(&settings_path())
}

/// Serialize settings to TOML and write them to `path`.
pub fn save_settings(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(settings)?)?;
    Ok(())
}
