// Bridge HTTP client
//
// Wraps `reqwest::Client` with bridge URL construction, rate-limit
// retries, and uniform error translation. The two API dialects (v2 and
// v1) are implemented as inherent methods in separate files to keep
// this module focused on transport mechanics.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, RawResponse, RequestFailure};
use crate::transport::TransportConfig;

/// Header carrying the application key on v2 and event-stream requests.
pub const APPLICATION_KEY_HEADER: &str = "hue-application-key";

// ── IgnoreErrors ─────────────────────────────────────────────────────

/// Which v2 envelope errors a request tolerates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IgnoreErrors {
    /// Any listed error fails the request.
    #[default]
    Never,
    /// Errors whose description contains the configured communication
    /// substring are tolerated; anything else fails.
    Communication,
    /// Listed errors never fail the request.
    All,
}

impl IgnoreErrors {
    /// Whether an error with `description` is tolerated under this policy.
    pub fn tolerates(self, description: &str, marker: &str) -> bool {
        match self {
            Self::Never => false,
            Self::Communication => description.contains(marker),
            Self::All => true,
        }
    }
}

// ── RequestOptions ───────────────────────────────────────────────────

/// Per-request overrides layered over the client's transport config.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Attempts made when the bridge answers 429. `None` uses the client default.
    pub max_retries: Option<u32>,
    /// Pause between 429 retries. `None` uses the client default.
    pub retry_delay: Option<Duration>,
    /// Whole-request timeout override.
    pub timeout: Option<Duration>,
    /// Extra headers sent with this request.
    pub headers: HeaderMap,
    /// v2 envelope error policy.
    pub ignore_errors: IgnoreErrors,
    /// v1: collapse a single-element success array into its element.
    pub squish_single: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            max_retries: None,
            retry_delay: None,
            timeout: None,
            headers: HeaderMap::new(),
            ignore_errors: IgnoreErrors::Never,
            squish_single: true,
        }
    }
}

impl RequestOptions {
    pub fn ignoring(ignore_errors: IgnoreErrors) -> Self {
        Self {
            ignore_errors,
            ..Self::default()
        }
    }
}

// ── BridgeClient ─────────────────────────────────────────────────────

/// Raw HTTP client for one bridge.
///
/// Every call returns parsed JSON or a [`RequestFailure`]; only HTTP 429
/// is retried, everything else is terminal for the call.
pub struct BridgeClient {
    http: reqwest::Client,
    stream_http: reqwest::Client,
    base_url: Url,
    application_key: SecretString,
    max_retries: u32,
    retry_delay: Duration,
    ignorable_error: String,
}

impl BridgeClient {
    /// Create a client for the bridge at `base_url` (e.g. `https://192.168.1.20`).
    pub fn new(
        base_url: Url,
        application_key: SecretString,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        // Reject keys that can never be sent before the first request does.
        HeaderValue::from_str(application_key.expose_secret())
            .map_err(|e| Error::InvalidApplicationKey(e.to_string()))?;

        Ok(Self {
            http: transport.build_client()?,
            stream_http: transport.build_stream_client()?,
            base_url,
            application_key,
            max_retries: transport.max_retries.max(1),
            retry_delay: transport.retry_delay,
            ignorable_error: transport.ignorable_error.clone(),
        })
    }

    /// Create a client for a bridge hostname over HTTPS.
    pub fn for_host(
        hostname: &str,
        application_key: SecretString,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let base_url = Url::parse(&format!("https://{hostname}"))?;
        Self::new(base_url, application_key, transport)
    }

    /// The bridge base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub(crate) fn application_key(&self) -> &str {
        self.application_key.expose_secret()
    }

    pub(crate) fn stream_http(&self) -> &reqwest::Client {
        &self.stream_http
    }

    pub(crate) fn ignorable_error(&self) -> &str {
        &self.ignorable_error
    }

    /// The application key as a sensitive header value.
    pub(crate) fn key_header(&self) -> HeaderValue {
        // Validated in `new`, so the fallback is unreachable in practice.
        let mut value = HeaderValue::from_str(self.application_key())
            .unwrap_or_else(|_| HeaderValue::from_static(""));
        value.set_sensitive(true);
        value
    }

    // ── URL builder ──────────────────────────────────────────────────

    /// Resolve an absolute bridge path (e.g. `/clip/v2/resource`) against the base URL.
    pub(crate) fn url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(path)?)
    }

    // ── Transport ────────────────────────────────────────────────────

    /// Perform one request and parse the response body as JSON.
    ///
    /// A 429 answer sleeps `retry_delay` and tries again, up to
    /// `max_retries` attempts in total. Any other non-2xx status, a
    /// transport failure, or an unparsable body fails immediately.
    pub async fn rest_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        options: &RequestOptions,
    ) -> Result<(serde_json::Value, RawResponse), Error> {
        let url = self.url(path)?;
        let payload = body.map(serde_json::Value::to_string);
        let max_retries = options.max_retries.unwrap_or(self.max_retries).max(1);
        let retry_delay = options.retry_delay.unwrap_or(self.retry_delay);
        let fail = |description: String| {
            RequestFailure::new(method.clone(), url.as_str(), payload.clone(), description)
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            debug!(%method, %url, attempt, "bridge request");

            let mut builder = self
                .http
                .request(method.clone(), url.clone())
                .headers(options.headers.clone());
            if let Some(ref p) = payload {
                builder = builder
                    .header(CONTENT_TYPE, "application/json")
                    .body(p.clone());
            }
            if let Some(timeout) = options.timeout {
                builder = builder.timeout(timeout);
            }

            let resp = builder
                .send()
                .await
                .map_err(|e| fail(format!("Transport error: {e}")))?;
            let status = resp.status();
            let raw = RawResponse::read(resp)
                .await
                .map_err(|e| fail(format!("Failed to read response body: {e}")))?;

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt < max_retries {
                    warn!(
                        %url,
                        attempt,
                        max_retries,
                        delay_ms = u64::try_from(retry_delay.as_millis()).unwrap_or(u64::MAX),
                        "bridge rate limited, retrying"
                    );
                    tokio::time::sleep(retry_delay).await;
                    continue;
                }
                return Err(fail(format!(
                    "Server returned HTTP {status} after {attempt} attempts"
                ))
                .with_response(raw)
                .into());
            }

            if !status.is_success() {
                return Err(fail(format!("Server returned HTTP {status}"))
                    .with_response(raw)
                    .into());
            }

            let parsed: serde_json::Value = match serde_json::from_str(&raw.body) {
                Ok(v) => v,
                Err(e) => {
                    trace!(error = %e, "unparsable bridge response");
                    return Err(fail("Unable to parse response as JSON".into())
                        .with_response(raw)
                        .into());
                }
            };

            return Ok((parsed, raw));
        }
    }
}

/// Join an endpoint onto an API prefix, tolerating missing or doubled slashes.
pub(crate) fn join_path(prefix: &str, endpoint: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let endpoint = endpoint.trim_start_matches('/');
    if endpoint.is_empty() {
        prefix.to_owned()
    } else {
        format!("{prefix}/{endpoint}")
    }
}
