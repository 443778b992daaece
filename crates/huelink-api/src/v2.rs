// CLIP v2 dialect
//
// Base path: /clip/v2/
// Auth: hue-application-key header
// Envelope: { "errors": [{ "description": ... }], "data": [...] }

use reqwest::Method;
use reqwest::header::HeaderValue;
use serde::Deserialize;
use tracing::debug;

use crate::client::{APPLICATION_KEY_HEADER, BridgeClient, RequestOptions, join_path};
use crate::error::{Error, RequestFailure};

pub const V2_PREFIX: &str = "/clip/v2";

#[derive(Debug, Deserialize)]
struct V2Envelope {
    #[serde(default)]
    errors: Vec<V2Error>,
    data: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct V2Error {
    #[serde(default)]
    description: String,
}

impl BridgeClient {
    /// Issue a v2 request and return the envelope's `data` array.
    ///
    /// Listed errors fail the call unless `options.ignore_errors` tolerates
    /// every one of them.
    pub async fn request_v2(
        &self,
        method: Method,
        endpoint: &str,
        payload: Option<&serde_json::Value>,
        options: &RequestOptions,
    ) -> Result<Vec<serde_json::Value>, Error> {
        let path = join_path(V2_PREFIX, endpoint);

        let mut options = options.clone();
        let key: HeaderValue = self.key_header();
        options.headers.insert(APPLICATION_KEY_HEADER, key);

        let (parsed, raw) = self
            .rest_request(method.clone(), &path, payload, &options)
            .await?;

        let fail = |description: String| {
            RequestFailure::new(
                method.clone(),
                raw_url(self, &path),
                payload.map(serde_json::Value::to_string),
                description,
            )
            .with_response(raw.clone())
            .with_parsed(parsed.clone())
        };

        let envelope: V2Envelope = serde_json::from_value(parsed.clone())
            .map_err(|e| fail(format!("API result is not in the expected format: {e}")))?;

        let blocking: Vec<&V2Error> = envelope
            .errors
            .iter()
            .filter(|e| {
                !options
                    .ignore_errors
                    .tolerates(&e.description, self.ignorable_error())
            })
            .collect();

        if !blocking.is_empty() {
            let listed = serde_json::to_string(&envelope.errors).unwrap_or_default();
            return Err(fail(format!("Server response listed errors: {listed}")).into());
        }

        if !envelope.errors.is_empty() {
            debug!(
                count = envelope.errors.len(),
                policy = ?options.ignore_errors,
                "ignoring bridge-reported errors"
            );
        }

        envelope
            .data
            .ok_or_else(|| fail("API result does not contain a data section".into()).into())
    }

    pub async fn get_v2(&self, endpoint: &str) -> Result<Vec<serde_json::Value>, Error> {
        self.request_v2(Method::GET, endpoint, None, &RequestOptions::default())
            .await
    }

    pub async fn post_v2(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<Vec<serde_json::Value>, Error> {
        self.request_v2(Method::POST, endpoint, Some(payload), &RequestOptions::default())
            .await
    }

    pub async fn put_v2(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<Vec<serde_json::Value>, Error> {
        self.request_v2(Method::PUT, endpoint, Some(payload), &RequestOptions::default())
            .await
    }

    pub async fn delete_v2(&self, endpoint: &str) -> Result<Vec<serde_json::Value>, Error> {
        self.request_v2(Method::DELETE, endpoint, None, &RequestOptions::default())
            .await
    }
}

/// Full URL string for error reporting; falls back to the bare path.
pub(crate) fn raw_url(client: &BridgeClient, path: &str) -> String {
    client
        .url(path)
        .map_or_else(|_| path.to_owned(), |u| u.to_string())
}
