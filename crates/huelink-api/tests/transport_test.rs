#![allow(clippy::unwrap_used)]
// Retry and error-translation tests for `BridgeClient::rest_request` using wiremock.

use std::time::{Duration, Instant};

use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use huelink_api::{BridgeClient, Error, Method, RequestOptions, TransportConfig};

// ── Helpers ─────────────────────────────────────────────────────────

const RETRY_DELAY: Duration = Duration::from_millis(50);

async fn setup() -> (MockServer, BridgeClient) {
    let server = MockServer::start().await;
    let transport = TransportConfig {
        retry_delay: RETRY_DELAY,
        ..TransportConfig::default()
    };
    let client = BridgeClient::new(
        server.uri().parse().unwrap(),
        SecretString::from("test-key".to_string()),
        &transport,
    )
    .unwrap();
    (server, client)
}

// ── Happy path ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_rest_request_returns_parsed_and_raw() {
    let (server, client) = setup().await;

    Mock::given(method("PUT"))
        .and(path("/clip/v2/resource/light/l1"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({ "on": { "on": true } })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-bridge", "1")
                .set_body_json(json!({ "errors": [], "data": [] })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (parsed, raw) = client
        .rest_request(
            Method::PUT,
            "/clip/v2/resource/light/l1",
            Some(&json!({ "on": { "on": true } })),
            &RequestOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(parsed, json!({ "errors": [], "data": [] }));
    assert_eq!(raw.status.as_u16(), 200);
    assert_eq!(raw.headers.get("x-bridge").unwrap(), "1");
}

// ── Rate limiting ───────────────────────────────────────────────────

#[tokio::test]
async fn test_persistent_429_fails_after_max_attempts() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/clip/v2/resource"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let started = Instant::now();
    let err = client
        .rest_request(Method::GET, "/clip/v2/resource", None, &RequestOptions::default())
        .await
        .unwrap_err();

    assert!(started.elapsed() >= RETRY_DELAY * 2);
    assert!(err.is_rate_limited());
    let failure = err.failure().unwrap();
    assert_eq!(failure.method, Method::GET);
    assert!(failure.url.ends_with("/clip/v2/resource"));
    assert!(failure.description.contains("after 3 attempts"));
}

#[tokio::test]
async fn test_429_then_success_takes_two_attempts() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/clip/v2/resource"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let started = Instant::now();
    let (parsed, _) = client
        .rest_request(Method::GET, "/clip/v2/resource", None, &RequestOptions::default())
        .await
        .unwrap();

    assert!(started.elapsed() >= RETRY_DELAY);
    assert_eq!(parsed, json!({ "data": [] }));
}

#[tokio::test]
async fn test_per_request_retry_override() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/clip/v2/resource"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;

    let options = RequestOptions {
        max_retries: Some(1),
        ..RequestOptions::default()
    };
    let err = client
        .rest_request(Method::GET, "/clip/v2/resource", None, &options)
        .await
        .unwrap_err();

    assert!(err.is_rate_limited());
}

// ── Terminal failures ───────────────────────────────────────────────

#[tokio::test]
async fn test_server_error_is_not_retried() {
    let (server, client) = setup().await;

    Mock::given(method("DELETE"))
        .and(path("/clip/v2/resource/scene/s1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client
        .rest_request(
            Method::DELETE,
            "/clip/v2/resource/scene/s1",
            None,
            &RequestOptions::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(500));
    let failure = err.failure().unwrap();
    assert_eq!(failure.response.as_ref().unwrap().body, "boom");
    assert!(err.to_string().starts_with("Request failed: DELETE "));
    assert!(err.to_string().contains("Server returned HTTP 500"));
}

#[tokio::test]
async fn test_unparsable_body_is_a_failure() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/clip/v2/resource"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client
        .rest_request(Method::GET, "/clip/v2/resource", None, &RequestOptions::default())
        .await
        .unwrap_err();

    let failure = err.failure().unwrap();
    assert_eq!(failure.description, "Unable to parse response as JSON");
    assert!(failure.parsed.is_none());
    assert_eq!(failure.response.as_ref().unwrap().body, "<html>");
}

#[tokio::test]
async fn test_connection_refused_is_a_request_failure() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let client = BridgeClient::new(
        uri.parse().unwrap(),
        SecretString::from("test-key".to_string()),
        &TransportConfig::default(),
    )
    .unwrap();

    let err = client
        .rest_request(Method::GET, "/clip/v2/resource", None, &RequestOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RequestFailed(_)));
    assert!(err.failure().unwrap().response.is_none());
}
