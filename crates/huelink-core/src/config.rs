// ── Runtime hub configuration ──
//
// These types describe how to reach one bridge and how the sync loops
// behave. They carry credential data and tuning, but never touch disk.
// huelink-config (or the application) builds them and hands them in.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use huelink_api::{DEFAULT_IGNORABLE_ERROR, ReconnectConfig, TlsMode, TransportConfig};

/// Credentials for one bridge.
#[derive(Debug, Clone)]
pub struct BridgeCredentials {
    /// Hostname or IP address of the bridge.
    pub hostname: String,
    /// The `hue-application-key` issued by the bridge.
    pub application_key: SecretString,
    /// Bridge id as reported during discovery, if known.
    pub bridge_id: Option<String>,
}

impl BridgeCredentials {
    pub fn new(hostname: impl Into<String>, application_key: SecretString) -> Self {
        Self {
            hostname: hostname.into(),
            application_key,
            bridge_id: None,
        }
    }

    #[must_use]
    pub fn with_bridge_id(mut self, id: impl Into<String>) -> Self {
        self.bridge_id = Some(id.into());
        self
    }
}

/// TLS verification strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// System CA store (strict).
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(std::path::PathBuf),
    /// Skip verification. Bridges ship self-signed certificates.
    #[default]
    DangerAcceptInvalid,
}

/// Tuning for one [`Hub`](crate::Hub).
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Overrides `https://{hostname}`; mostly for tests.
    pub base_url: Option<Url>,
    pub tls: TlsVerification,
    /// Whole-request timeout for API calls.
    pub timeout: Duration,
    /// Attempts per request when the bridge answers 429.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Substring marking an ignorable "communication issues" error.
    pub ignorable_error: String,
    /// Maximum age of the last full refresh before the scheduler does another.
    pub refresh_interval: Duration,
    /// Wait after a failed full refresh before the scheduler tries again.
    pub refresh_retry_delay: Duration,
    pub tick_interval: Duration,
    /// More stale resources than this trigger a full refresh instead of
    /// per-resource refreshes.
    pub stale_refresh_threshold: usize,
    /// Minimum time between event-stream connection attempts.
    pub reconnect_interval: Duration,
    /// Transition time used by light commands when none is given.
    pub default_duration: Duration,
    /// Hold time above which a release counts as a long press.
    pub long_press_threshold: Duration,
    /// A held button whose last update is older than this is stale.
    pub button_stale_after: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            tls: TlsVerification::default(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            ignorable_error: DEFAULT_IGNORABLE_ERROR.into(),
            refresh_interval: Duration::from_secs(60),
            refresh_retry_delay: Duration::from_secs(5),
            tick_interval: Duration::from_millis(10),
            stale_refresh_threshold: 2,
            reconnect_interval: Duration::from_secs(5),
            default_duration: Duration::from_millis(500),
            long_press_threshold: Duration::from_millis(500),
            button_stale_after: Duration::from_secs(1),
        }
    }
}

impl HubConfig {
    pub(crate) fn transport(&self) -> TransportConfig {
        let tls = match &self.tls {
            TlsVerification::SystemDefaults => TlsMode::System,
            TlsVerification::CustomCa(path) => TlsMode::CustomCa(path.clone()),
            TlsVerification::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
        };
        TransportConfig {
            tls,
            timeout: self.timeout,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            ignorable_error: self.ignorable_error.clone(),
            ..TransportConfig::default()
        }
    }

    pub(crate) fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            min_interval: self.reconnect_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = HubConfig::default();
        assert_eq!(config.refresh_interval, Duration::from_secs(60));
        assert_eq!(config.tick_interval, Duration::from_millis(10));
        assert_eq!(config.stale_refresh_threshold, 2);
        assert_eq!(config.long_press_threshold, Duration::from_millis(500));
        assert_eq!(config.tls, TlsVerification::DangerAcceptInvalid);
    }

    #[test]
    fn transport_carries_retry_policy() {
        let config = HubConfig {
            max_retries: 7,
            retry_delay: Duration::from_millis(20),
            tls: TlsVerification::SystemDefaults,
            ..HubConfig::default()
        };
        let transport = config.transport();
        assert_eq!(transport.max_retries, 7);
        assert_eq!(transport.retry_delay, Duration::from_millis(20));
        assert!(matches!(transport.tls, TlsMode::System));
    }
}
