// huelink-api: Async Rust client for the Hue bridge CLIP API (v2 + v1) and its event stream

pub mod client;
pub mod error;
pub mod eventstream;
pub mod transport;
pub mod v1;
pub mod v2;

pub use client::{APPLICATION_KEY_HEADER, BridgeClient, IgnoreErrors, RequestOptions};
pub use error::{Error, RawResponse, RequestFailure};
pub use eventstream::{
    EVENT_STREAM_PATH, EventStreamHandle, LineBuffer, LineTooLong, MAX_LINE_BYTES, ReconnectConfig,
    StreamEvent, StreamMessage,
};
pub use reqwest::Method;
pub use transport::{DEFAULT_IGNORABLE_ERROR, TlsMode, TransportConfig};
pub use v2::V2_PREFIX;
