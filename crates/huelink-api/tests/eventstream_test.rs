#![allow(clippy::unwrap_used)]
// Event-stream loop tests against a wiremock bridge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use huelink_api::{
    BridgeClient, EventStreamHandle, MAX_LINE_BYTES, ReconnectConfig, StreamEvent, TransportConfig,
};

// ── Helpers ─────────────────────────────────────────────────────────

const BODY: &str = concat!(
    ": hi\n\n",
    "id: 1714557600:0\n",
    r#"data: [{"creationtime":"2024-05-01T10:00:00Z","id":"b1","type":"update","data":[{"id":"l1","type":"light","on":{"on":true}}]}]"#,
    "\n\n",
    "data: garbage\n\n",
);

async fn setup() -> (MockServer, Arc<BridgeClient>) {
    let server = MockServer::start().await;
    let client = BridgeClient::new(
        server.uri().parse().unwrap(),
        SecretString::from("app-key".to_string()),
        &TransportConfig::default(),
    )
    .unwrap();
    (server, Arc::new(client))
}

async fn next(rx: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("stream event in time")
        .expect("stream still open")
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        min_interval: Duration::from_millis(100),
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stream_delivers_messages_then_reconnects() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/eventstream/clip/v2"))
        .and(header("accept", "text/event-stream"))
        .and(header("hue-application-key", "app-key"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(BODY),
        )
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let (handle, mut rx) = EventStreamHandle::spawn(client, fast_reconnect(), cancel);

    assert!(matches!(next(&mut rx).await, StreamEvent::Connected));
    let StreamEvent::Messages(batch) = next(&mut rx).await else {
        panic!("expected a message batch");
    };
    assert_eq!(batch.len(), 1);
    assert!(batch[0].is_update());
    assert_eq!(batch[0].data[0]["id"], "l1");

    let disconnected_at = Instant::now();
    assert!(matches!(
        next(&mut rx).await,
        StreamEvent::Disconnected { .. }
    ));
    assert!(matches!(next(&mut rx).await, StreamEvent::Connected));
    assert!(disconnected_at.elapsed() <= Duration::from_secs(5));

    handle.shutdown();
    assert!(handle.is_shutdown());
}

#[tokio::test]
async fn test_failed_connect_reports_disconnect_and_waits() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/eventstream/clip/v2"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let (_handle, mut rx) = EventStreamHandle::spawn(client, fast_reconnect(), cancel);

    let started = Instant::now();
    let StreamEvent::Disconnected { reason } = next(&mut rx).await else {
        panic!("expected a disconnect");
    };
    assert!(reason.contains("HTTP 403"));

    assert!(matches!(
        next(&mut rx).await,
        StreamEvent::Disconnected { .. }
    ));
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_shutdown_closes_the_channel() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/eventstream/clip/v2"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let (handle, mut rx) = EventStreamHandle::spawn(client, ReconnectConfig::default(), cancel);

    assert!(matches!(
        next(&mut rx).await,
        StreamEvent::Disconnected { .. }
    ));
    handle.shutdown();

    let closed = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn test_overlong_line_drops_the_connection() {
    let (server, client) = setup().await;

    let body = format!("data: [{}", "x".repeat(MAX_LINE_BYTES + 1));
    Mock::given(method("GET"))
        .and(path("/eventstream/clip/v2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let (handle, mut rx) = EventStreamHandle::spawn(client, fast_reconnect(), cancel);

    assert!(matches!(next(&mut rx).await, StreamEvent::Connected));
    let StreamEvent::Disconnected { reason } = next(&mut rx).await else {
        panic!("expected a disconnect");
    };
    assert!(reason.contains("line exceeded"), "{reason}");
    assert!(matches!(next(&mut rx).await, StreamEvent::Connected));

    handle.shutdown();
}
