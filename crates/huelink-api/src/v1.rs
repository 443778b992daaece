// Legacy v1 dialect
//
// Base path: /api/{application-key}/
// Responses are either a plain object or an array of
// `{"success": {...}}` / `{"error": {"description": ...}}` items.

use reqwest::Method;

use crate::client::{BridgeClient, RequestOptions, join_path};
use crate::error::{Error, RequestFailure};
use crate::v2::raw_url;

impl BridgeClient {
    /// Issue a v1 request.
    ///
    /// Objects come back unchanged. Arrays are validated item by item and
    /// reduced to their `success` payloads, collapsed to the single payload
    /// when exactly one came back and `options.squish_single` is set.
    pub async fn request_v1(
        &self,
        method: Method,
        endpoint: &str,
        payload: Option<&serde_json::Value>,
        options: &RequestOptions,
    ) -> Result<serde_json::Value, Error> {
        let prefix = format!("/api/{}", self.application_key());
        let path = join_path(&prefix, endpoint);

        let (parsed, raw) = self
            .rest_request(method.clone(), &path, payload, options)
            .await?;

        let items = match parsed {
            serde_json::Value::Array(items) => items,
            other => return Ok(other),
        };

        let fail = |description: String| {
            RequestFailure::new(
                method.clone(),
                raw_url(self, &path),
                payload.map(serde_json::Value::to_string),
                description,
            )
            .with_response(raw.clone())
            .with_parsed(serde_json::Value::Array(items.clone()))
        };

        let mut reduced = Vec::with_capacity(items.len());
        for item in &items {
            let Some(obj) = item.as_object() else {
                return Err(fail("Expected second-level JSON responses to be objects".into()).into());
            };
            if let Some(error) = obj.get("error") {
                let description = error
                    .get("description")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown error");
                return Err(fail(format!("JSON response contained error: {description}")).into());
            }
            let Some(success) = obj.get("success") else {
                return Err(fail("JSON response did not contain successful response".into()).into());
            };
            reduced.push(success.clone());
        }

        if reduced.len() == 1 && options.squish_single {
            return Ok(reduced.swap_remove(0));
        }
        Ok(serde_json::Value::Array(reduced))
    }

    pub async fn get_v1(&self, endpoint: &str) -> Result<serde_json::Value, Error> {
        self.request_v1(Method::GET, endpoint, None, &RequestOptions::default())
            .await
    }

    pub async fn post_v1(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        self.request_v1(Method::POST, endpoint, Some(payload), &RequestOptions::default())
            .await
    }

    pub async fn put_v1(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        self.request_v1(Method::PUT, endpoint, Some(payload), &RequestOptions::default())
            .await
    }

    pub async fn delete_v1(&self, endpoint: &str) -> Result<serde_json::Value, Error> {
        self.request_v1(Method::DELETE, endpoint, None, &RequestOptions::default())
            .await
    }

    /// All v1 rules (`GET /api/{key}/rules`).
    pub async fn rules_v1(&self) -> Result<serde_json::Value, Error> {
        self.get_v1("/rules").await
    }
}
