#![allow(clippy::unwrap_used)]
// Hub lifecycle, event delivery, and scheduling against a wiremock bridge.

use std::future::{Ready, ready};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::time::timeout;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use huelink_core::{
    Batch, BridgeCredentials, CoreError, EventKind, Hub, HubConfig, HubEvent, Update, UpdateSource,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn config(server: &MockServer) -> HubConfig {
    HubConfig {
        base_url: Some(server.uri().parse().unwrap()),
        retry_delay: Duration::from_millis(10),
        reconnect_interval: Duration::from_secs(30),
        ..HubConfig::default()
    }
}

fn hub(config: HubConfig) -> Hub {
    let credentials = BridgeCredentials::new("bridge.test", SecretString::from("app-key".to_string()));
    Hub::new(credentials, config).unwrap()
}

fn envelope(data: Vec<Value>) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "errors": [], "data": data }))
}

fn snapshot() -> Vec<Value> {
    vec![
        json!({ "id": "l1", "type": "light", "on": { "on": false } }),
        json!({ "id": "d1", "type": "device", "product_data": { "model_id": "LCT015" },
                "services": [{ "rid": "b1", "rtype": "button" }] }),
        json!({ "id": "b1", "type": "button", "metadata": { "control_id": 1 },
                "owner": { "rid": "d1", "rtype": "device" } }),
    ]
}

async fn mount_snapshot(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource"))
        .respond_with(envelope(snapshot()))
        .mount(server)
        .await;
}

async fn mount_stream(server: &MockServer, body: &str) {
    Mock::given(method("GET"))
        .and(path("/eventstream/clip/v2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(server)
        .await;
}

async fn next_update(events: &mut tokio::sync::broadcast::Receiver<HubEvent>) -> Arc<Update> {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("hub event in time")
            .expect("event channel open");
        if let HubEvent::Update(update) = event {
            return update;
        }
    }
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_activate_loads_resources_and_deactivate_stops() {
    let server = MockServer::start().await;
    mount_snapshot(&server).await;
    mount_stream(&server, ": hi\n\n").await;

    let hub = hub(config(&server));
    hub.activate().await.unwrap();
    assert!(hub.is_active());
    assert_eq!(hub.store().len(), 3);
    assert!(hub.last_refresh().is_some());

    // a second activate is a no-op
    hub.activate().await.unwrap();

    hub.deactivate().await;
    assert!(!hub.is_active());
    hub.deactivate().await;
}

#[tokio::test]
async fn test_activate_fails_when_baseline_refresh_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    mount_stream(&server, "").await;

    let hub = hub(config(&server));
    let err = hub.activate().await.unwrap_err();
    assert!(matches!(err, CoreError::RequestFailed(_)));
    assert!(!hub.is_active());
}

#[tokio::test]
async fn test_stream_updates_reach_watchers() {
    let server = MockServer::start().await;
    mount_snapshot(&server).await;
    let body = concat!(
        ": hi\n\n",
        r#"data: [{"creationtime":"2024-05-01T10:00:00Z","id":"batch-1","type":"update","data":[{"id":"l1","type":"light","on":{"on":true}}]}]"#,
        "\n\n",
    );
    mount_stream(&server, body).await;
    // the stream may beat the baseline refresh to l1
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/light/l1"))
        .respond_with(envelope(vec![json!({ "id": "l1", "type": "light", "on": { "on": false } })]))
        .mount(&server)
        .await;

    let hub = hub(config(&server));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    hub.watch(&[EventKind::Update], move |event| {
        if let Some(update) = event.as_update() {
            sink.lock().unwrap().push(update.resource_id().to_owned());
        }
    });
    let mut events = hub.events();

    hub.activate().await.unwrap();
    let update = next_update(&mut events).await;

    assert_eq!(update.resource_id(), "l1");
    assert_eq!(update.batch_id(), Some("batch-1"));
    assert_eq!(update.source(), UpdateSource::Stream);
    assert_eq!(hub.resource("l1").unwrap().pointer("/on/on"), Some(json!(true)));
    assert_eq!(*seen.lock().unwrap(), vec!["l1".to_owned()]);

    hub.deactivate().await;
}

#[tokio::test]
async fn test_refresh_emits_refreshed_event() {
    let server = MockServer::start().await;
    mount_snapshot(&server).await;

    let hub = hub(config(&server));
    let refreshed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&refreshed);
    hub.watch(&[EventKind::Refresh], move |event| {
        if let HubEvent::Refreshed { resources, .. } = event {
            counter.store(*resources, Ordering::SeqCst);
        }
    });

    hub.refresh().await.unwrap();
    assert_eq!(refreshed.load(Ordering::SeqCst), 3);
}

// ── Tasks ───────────────────────────────────────────────────────────

fn counting(
    counter: &Arc<AtomicUsize>,
) -> impl Fn(Hub) -> Ready<Result<(), CoreError>> + Send + Sync + 'static {
    let counter = Arc::clone(counter);
    move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        ready(Ok(()))
    }
}

fn explode() -> Result<(), CoreError> {
    panic!("task blew up")
}

#[tokio::test]
async fn test_task_runs_once_per_tick_and_can_be_replaced() {
    let server = MockServer::start().await;
    mount_snapshot(&server).await;
    let hub = hub(config(&server));

    let first = Arc::new(AtomicUsize::new(0));
    hub.task("t1", Duration::ZERO, counting(&first));
    hub.tick().await;
    assert_eq!(first.load(Ordering::SeqCst), 1);

    let second = Arc::new(AtomicUsize::new(0));
    hub.task("t1", Duration::ZERO, counting(&second));
    assert_eq!(hub.tasks(), vec!["t1".to_owned()]);
    hub.tick().await;
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);

    assert!(hub.end_task("t1"));
    assert!(!hub.end_task("t1"));
    hub.tick().await;
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_task_waits_for_its_interval() {
    let server = MockServer::start().await;
    mount_snapshot(&server).await;
    let hub = hub(config(&server));

    let runs = Arc::new(AtomicUsize::new(0));
    hub.task("slow", Duration::from_secs(3600), counting(&runs));
    hub.tick().await;
    hub.tick().await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failing_tasks_do_not_stop_others() {
    let server = MockServer::start().await;
    mount_snapshot(&server).await;
    let hub = hub(config(&server));

    hub.task("errors", Duration::ZERO, |_| async { Err::<(), _>(CoreError::task("boom")) });
    hub.task("panics", Duration::ZERO, |_| async { explode() });
    let runs = Arc::new(AtomicUsize::new(0));
    hub.task("works", Duration::ZERO, counting(&runs));

    hub.tick().await;
    hub.tick().await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(hub.has_task("panics"));
}

#[tokio::test]
async fn test_task_with_unbounded_interval_runs_once() {
    let server = MockServer::start().await;
    mount_snapshot(&server).await;
    let hub = hub(config(&server));

    let once = Arc::new(AtomicUsize::new(0));
    hub.task("never", Duration::MAX, counting(&once));
    let runs = Arc::new(AtomicUsize::new(0));
    hub.task("works", Duration::ZERO, counting(&runs));

    hub.tick().await;
    hub.tick().await;
    assert_eq!(once.load(Ordering::SeqCst), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(hub.has_task("never"));
}

// ── Scheduler repair ────────────────────────────────────────────────

#[tokio::test]
async fn test_tick_refreshes_when_never_refreshed() {
    let server = MockServer::start().await;
    mount_snapshot(&server).await;
    let hub = hub(config(&server));

    assert!(hub.last_refresh().is_none());
    hub.tick().await;
    assert!(hub.last_refresh().is_some());
    assert_eq!(hub.store().len(), 3);
}

#[tokio::test]
async fn test_tick_backs_off_after_failed_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    let hub = hub(config(&server));

    hub.tick().await;
    hub.tick().await;
    assert!(hub.last_refresh().is_none());
    server.verify().await;
}

#[tokio::test]
async fn test_tick_repairs_a_stale_held_button() {
    let server = MockServer::start().await;
    mount_snapshot(&server).await;
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/button/b1"))
        .respond_with(envelope(vec![json!({
            "id": "b1", "type": "button",
            "button": { "button_report": { "event": "short_release", "updated": "t1" } },
        })]))
        .expect(1)
        .mount(&server)
        .await;
    let hub = hub(HubConfig {
        button_stale_after: Duration::from_millis(50),
        ..config(&server)
    });
    hub.refresh().await.unwrap();

    let button = hub.resource("b1").unwrap();
    let press = json!({ "button": { "button_report": { "event": "initial_press", "updated": "t0" } } });
    hub.store().apply(&button, &Batch::fetch(), &press).unwrap();
    assert!(button.is_pressed());
    assert!(!button.is_stale());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(button.is_stale());

    hub.tick().await;
    assert!(!button.is_pressed());
    assert!(!button.is_stale());
    server.verify().await;
}
