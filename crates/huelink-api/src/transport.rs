// Shared transport configuration for building reqwest::Client instances.
//
// The request client and the event-stream client share TLS settings
// through this module; only their timeouts differ.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;

const USER_AGENT: &str = concat!("huelink/", env!("CARGO_PKG_VERSION"));

/// Substring the bridge uses for its "device is unreachable" errors.
pub const DEFAULT_IGNORABLE_ERROR: &str = "communication issues";

/// TLS verification mode.
#[derive(Debug, Clone)]
pub enum TlsMode {
    /// Use the system certificate store.
    System,
    /// Use a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate (bridges ship self-signed certificates).
    DangerAcceptInvalid,
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    /// Whole-request timeout for ordinary API calls.
    pub timeout: Duration,
    /// Connect timeout, also applied to the event stream.
    pub connect_timeout: Duration,
    /// Attempts made when the bridge answers 429 (including the first).
    pub max_retries: u32,
    /// Pause between 429 retries.
    pub retry_delay: Duration,
    /// Description substring matched by [`IgnoreErrors::Communication`](crate::IgnoreErrors::Communication).
    pub ignorable_error: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::DangerAcceptInvalid,
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            ignorable_error: DEFAULT_IGNORABLE_ERROR.into(),
        }
    }
}

impl TransportConfig {
    /// Build the `reqwest::Client` used for request/response calls.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .user_agent(USER_AGENT);

        self.apply_tls(builder)?
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }

    /// Build the `reqwest::Client` used for the event stream.
    ///
    /// No whole-request timeout: the stream idles between events and is
    /// expected to stay open indefinitely.
    pub fn build_stream_client(&self) -> Result<reqwest::Client, Error> {
        let builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .user_agent(USER_AGENT);

        self.apply_tls(builder)?
            .build()
            .map_err(|e| Error::Tls(format!("failed to build stream client: {e}")))
    }

    fn apply_tls(
        &self,
        builder: reqwest::ClientBuilder,
    ) -> Result<reqwest::ClientBuilder, Error> {
        match &self.tls {
            TlsMode::System => Ok(builder),
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&cert_pem)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                Ok(builder.add_root_certificate(cert))
            }
            TlsMode::DangerAcceptInvalid => Ok(builder.danger_accept_invalid_certs(true)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_bridge_expectations() {
        let config = TransportConfig::default();
        assert!(matches!(config.tls, TlsMode::DangerAcceptInvalid));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert_eq!(config.ignorable_error, "communication issues");
    }

    #[test]
    fn missing_ca_file_is_a_tls_error() {
        let config = TransportConfig {
            tls: TlsMode::CustomCa("/nonexistent/ca.pem".into()),
            ..TransportConfig::default()
        };
        assert!(matches!(config.build_client(), Err(Error::Tls(_))));
    }
}
