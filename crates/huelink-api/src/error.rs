use std::fmt;

use reqwest::Method;
use reqwest::header::HeaderMap;
use thiserror::Error;

/// Top-level error type for the `huelink-api` crate.
///
/// Every failure on the request surface is a [`RequestFailure`]; the other
/// variants can only occur while a client is being built.
/// `huelink-core` maps these into its own error type.
#[derive(Debug, Error)]
pub enum Error {
    // ── Requests ────────────────────────────────────────────────────
    /// HTTP, transport, or envelope failure for a single bridge request.
    #[error("{0}")]
    RequestFailed(Box<RequestFailure>),

    // ── Client construction ─────────────────────────────────────────
    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS setup or HTTP client construction error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The application key cannot be sent as a header value.
    #[error("Invalid application key: {0}")]
    InvalidApplicationKey(String),
}

impl Error {
    /// The request failure details, if this is a request error.
    pub fn failure(&self) -> Option<&RequestFailure> {
        match self {
            Self::RequestFailed(f) => Some(f),
            _ => None,
        }
    }

    /// HTTP status of the bridge response, if one was received.
    pub fn status(&self) -> Option<u16> {
        self.failure()
            .and_then(|f| f.response.as_ref())
            .map(|r| r.status.as_u16())
    }

    /// Returns `true` if the bridge answered 429 on the final attempt.
    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }

    /// Returns `true` for a 404 from the bridge.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

impl From<RequestFailure> for Error {
    fn from(failure: RequestFailure) -> Self {
        Self::RequestFailed(Box::new(failure))
    }
}

// ── RawResponse ──────────────────────────────────────────────────────

/// The parts of a bridge response kept for callers and diagnostics.
///
/// The body is read eagerly so that a failed request can still carry
/// what the bridge said.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: reqwest::StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl RawResponse {
    pub(crate) async fn read(resp: reqwest::Response) -> Result<Self, reqwest::Error> {
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }
}

// ── RequestFailure ───────────────────────────────────────────────────

/// Everything known about a failed bridge request.
#[derive(Debug)]
pub struct RequestFailure {
    pub method: Method,
    pub url: String,
    /// Serialized request body, if one was sent.
    pub payload: Option<String>,
    /// The bridge response, when the failure happened after one arrived.
    pub response: Option<RawResponse>,
    /// The parsed response body, when it was valid JSON.
    pub parsed: Option<serde_json::Value>,
    pub description: String,
}

impl RequestFailure {
    pub fn new(
        method: Method,
        url: impl Into<String>,
        payload: Option<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            method,
            url: url.into(),
            payload,
            response: None,
            parsed: None,
            description: description.into(),
        }
    }

    #[must_use]
    pub fn with_response(mut self, response: RawResponse) -> Self {
        self.response = Some(response);
        self
    }

    #[must_use]
    pub fn with_parsed(mut self, parsed: serde_json::Value) -> Self {
        self.parsed = Some(parsed);
        self
    }
}

impl fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Request failed: {} {} {}",
            self.method, self.url, self.description
        )
    }
}
