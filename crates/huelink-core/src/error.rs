// ── Core error types ──
//
// Errors surfaced by huelink-core. Transport failures keep their full
// request context (`RequestFailure`); everything else is a domain error.
// The `From<huelink_api::Error>` impl translates client-construction
// errors into `Config`.

use thiserror::Error;

use huelink_api::RequestFailure;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Request errors ───────────────────────────────────────────────
    /// A bridge request failed; carries method, URL, payload and response.
    #[error("{0}")]
    RequestFailed(Box<RequestFailure>),

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Unresolvable reference: {reference}")]
    UnresolvableReference { reference: String },

    // ── Lifecycle errors ─────────────────────────────────────────────
    /// A background handle outlived its hub.
    #[error("Hub has been dropped")]
    HubDropped,

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Task errors ──────────────────────────────────────────────────
    /// Returned by user task callbacks; only ever logged.
    #[error("Task failed: {message}")]
    Task { message: String },
}

impl CoreError {
    /// The underlying request failure, if any.
    pub fn request_failure(&self) -> Option<&RequestFailure> {
        match self {
            Self::RequestFailed(f) => Some(f),
            _ => None,
        }
    }

    /// Convenience for task callbacks.
    pub fn task(message: impl Into<String>) -> Self {
        Self::Task {
            message: message.into(),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<huelink_api::Error> for CoreError {
    fn from(err: huelink_api::Error) -> Self {
        match err {
            huelink_api::Error::RequestFailed(failure) => CoreError::RequestFailed(failure),
            huelink_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            huelink_api::Error::Tls(msg) => CoreError::Config {
                message: format!("TLS error: {msg}"),
            },
            huelink_api::Error::InvalidApplicationKey(msg) => CoreError::Config {
                message: format!("Invalid application key: {msg}"),
            },
        }
    }
}
