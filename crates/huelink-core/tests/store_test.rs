#![allow(clippy::unwrap_used)]
// Resource store behavior against a wiremock bridge.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use huelink_core::{
    Batch, BridgeCredentials, Button, CoreError, Hub, HubConfig, Query, Reference, ResourceKind,
    SwitchPosition, UpdateSource,
};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, Hub) {
    let server = MockServer::start().await;
    let config = HubConfig {
        base_url: Some(server.uri().parse().unwrap()),
        retry_delay: Duration::from_millis(10),
        ..HubConfig::default()
    };
    let credentials = BridgeCredentials::new("bridge.test", SecretString::from("app-key".to_string()));
    (server, Hub::new(credentials, config).unwrap())
}

fn envelope(data: Vec<Value>) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "errors": [], "data": data }))
}

fn snapshot(l1_on: bool) -> Vec<Value> {
    vec![
        json!({ "id": "l1", "type": "light", "metadata": { "name": "Desk" }, "on": { "on": l1_on } }),
        json!({ "id": "l2", "type": "light", "metadata": { "name": "Shelf" }, "on": { "on": false } }),
        json!({ "id": "r1", "type": "room", "metadata": { "name": "Office" },
                "children": [{ "rid": "d1", "rtype": "device" }] }),
        json!({ "id": "d1", "type": "device", "product_data": { "model_id": "FOHSWITCH" },
                "services": [{ "rid": "b1", "rtype": "button" }] }),
        json!({ "id": "b1", "type": "button", "metadata": { "control_id": 1 },
                "owner": { "rid": "d1", "rtype": "device" } }),
    ]
}

async fn mount_snapshot(server: &MockServer, data: Vec<Value>, times: u64) {
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource"))
        .respond_with(envelope(data))
        .up_to_n_times(times)
        .mount(server)
        .await;
}

// ── Refresh ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_refresh_creates_resources_and_keeps_identity() {
    let (server, hub) = setup().await;
    mount_snapshot(&server, snapshot(false), 1).await;
    mount_snapshot(&server, snapshot(true), 1).await;

    let first = hub.refresh().await.unwrap();
    assert!(first.is_empty(), "creations are not updates");
    assert_eq!(hub.store().len(), 5);
    assert!(hub.last_refresh().is_some());

    let l1 = hub.resource("l1").unwrap();
    assert_eq!(l1.kind(), ResourceKind::Light);
    assert_eq!(hub.resource("d1").unwrap().kind(), ResourceKind::FourButtonSwitch);

    let second = hub.refresh().await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].resource_id(), "l1");
    assert_eq!(second[0].source(), UpdateSource::Refresh);

    let again = hub.resource("l1").unwrap();
    assert!(Arc::ptr_eq(&l1, &again));
    assert_eq!(again.pointer("/on/on"), Some(json!(true)));
    assert_eq!(again.sequence(), 1);
}

#[tokio::test]
async fn test_refresh_skips_resources_updated_in_flight() {
    let (server, hub) = setup().await;
    mount_snapshot(&server, snapshot(false), 1).await;
    hub.refresh().await.unwrap();

    Mock::given(method("GET"))
        .and(path("/clip/v2/resource"))
        .respond_with(envelope(snapshot(false)).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let background = hub.clone();
    let refresh = tokio::spawn(async move { background.refresh().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let l1 = hub.resource("l1").unwrap();
    hub.store()
        .apply(&l1, &Batch::fetch(), &json!({ "on": { "on": true } }))
        .unwrap();

    let updates = refresh.await.unwrap().unwrap();
    assert!(updates.is_empty());
    assert_eq!(l1.pointer("/on/on"), Some(json!(true)));
    assert_eq!(l1.sequence(), 1);
}

#[tokio::test]
async fn test_refresh_failure_is_reported() {
    let (server, hub) = setup().await;
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = hub.refresh().await.unwrap_err();
    assert!(err.request_failure().is_some());
    assert!(hub.last_refresh().is_none());
}

// ── Queries ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_find_filters_cached_resources() {
    let (server, hub) = setup().await;
    mount_snapshot(&server, snapshot(false), 1).await;
    hub.refresh().await.unwrap();

    let mut lights: Vec<String> = hub
        .find(&Query::of_type("light"))
        .iter()
        .map(|r| r.id().to_owned())
        .collect();
    lights.sort();
    assert_eq!(lights, vec!["l1", "l2"]);
    assert_eq!(hub.lights().len(), 2);

    let desk = hub.find_where(&Query::of_type("light"), |r| r.name().as_deref() == Some("Desk"));
    assert_eq!(desk.len(), 1);
    assert_eq!(desk[0].id(), "l1");

    assert!(hub.find(&Query::of_type("scene")).is_empty());
    assert_eq!(hub.find(&Query::new()).len(), 5);
}

// ── Resolution ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_resolve_known_id_makes_no_request() {
    let (server, hub) = setup().await;
    mount_snapshot(&server, snapshot(false), 1).await;
    hub.refresh().await.unwrap();
    let before = server.received_requests().await.unwrap().len();

    let resolved = hub.resolve(&Reference::new("l1", "light")).await.unwrap();
    assert!(Arc::ptr_eq(&resolved, &hub.resource("l1").unwrap()));
    assert_eq!(server.received_requests().await.unwrap().len(), before);
}

#[tokio::test]
async fn test_resolve_rejects_incomplete_references() {
    let (server, hub) = setup().await;

    for value in [json!({}), json!({ "id": "x" }), json!({ "rtype": "light" })] {
        let err = hub.resolve_value(&value).await.unwrap_err();
        assert!(matches!(err, CoreError::UnresolvableReference { .. }), "{value}");
    }
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resolve_unseen_fetches_exactly_once() {
    let (server, hub) = setup().await;
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/light/x"))
        .respond_with(envelope(vec![json!({ "id": "x", "type": "light", "on": { "on": true } })]))
        .expect(1)
        .mount(&server)
        .await;

    let reference = json!({ "id": "x", "type": "light" });
    let first = hub.resolve_value(&reference).await.unwrap();
    let second = hub.resolve_value(&json!({ "rid": "x", "rtype": "light" })).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.pointer("/on/on"), Some(json!(true)));
    assert_eq!(first.sequence(), 0);
    server.verify().await;
}

#[tokio::test]
async fn test_slow_resolve_does_not_overwrite_newer_state() {
    let (server, hub) = setup().await;
    let stale = json!({ "id": "x", "type": "light", "on": { "on": false } });
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/light/x"))
        .respond_with(envelope(vec![stale.clone()]).set_delay(Duration::from_millis(300)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/light/x"))
        .respond_with(envelope(vec![stale]))
        .mount(&server)
        .await;

    let background = hub.clone();
    let slow = tokio::spawn(async move { background.resolve(&Reference::new("x", "light")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let fast = hub.resolve(&Reference::new("x", "light")).await.unwrap();
    hub.store()
        .apply(&fast, &Batch::fetch(), &json!({ "on": { "on": true } }))
        .unwrap();

    let late = slow.await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&fast, &late));
    assert_eq!(late.pointer("/on/on"), Some(json!(true)));
    assert_eq!(late.sequence(), 1);
}

#[tokio::test]
async fn test_resolve_failure_leaves_cache_untouched() {
    let (server, hub) = setup().await;
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/light/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert!(hub.resolve(&Reference::new("gone", "light")).await.is_err());
    assert!(hub.resource("gone").is_none());
}

// ── Stream items ────────────────────────────────────────────────────

#[tokio::test]
async fn test_stream_item_on_switch_button_carries_position() {
    let (server, hub) = setup().await;
    mount_snapshot(&server, snapshot(false), 1).await;
    hub.refresh().await.unwrap();

    let store = hub.store();
    let press = json!({ "id": "b1", "type": "button",
                        "button": { "button_report": { "event": "initial_press", "updated": "t0" } } });
    let update = store.apply_stream_item(&Batch::fetch(), &press).await.unwrap().unwrap();

    assert_eq!(update.detail().position(), Some(SwitchPosition::LowerLeft));
    assert!(update.detail().button().unwrap().pressed);
    assert!(hub.resource("b1").unwrap().is_pressed());

    // the same payload again changes nothing
    assert!(store.apply_stream_item(&Batch::fetch(), &press).await.unwrap().is_none());
}

#[tokio::test]
async fn test_stream_item_for_unseen_resource_is_fetched() {
    let (server, hub) = setup().await;
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/light/l9"))
        .respond_with(envelope(vec![json!({ "id": "l9", "type": "light", "on": { "on": false } })]))
        .expect(1)
        .mount(&server)
        .await;

    let item = json!({ "id": "l9", "type": "light", "on": { "on": true } });
    let update = hub
        .store()
        .apply_stream_item(&Batch::fetch(), &item)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(update.old_state()["on"], json!({ "on": false }));
    assert_eq!(hub.resource("l9").unwrap().pointer("/on/on"), Some(json!(true)));
    server.verify().await;
}

// ── v1 rules ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_button_grouped_lights_follow_v1_rules() {
    let (server, hub) = setup().await;
    mount_snapshot(
        &server,
        vec![
            json!({ "id": "d1", "id_v1": "/sensors/12", "type": "device",
                    "product_data": { "model_id": "FOHSWITCH" },
                    "services": [{ "rid": "b1", "rtype": "button" }] }),
            json!({ "id": "b1", "type": "button", "metadata": { "control_id": 1 },
                    "owner": { "rid": "d1", "rtype": "device" } }),
            json!({ "id": "g3", "id_v1": "/groups/3", "type": "grouped_light" }),
            json!({ "id": "g4", "id_v1": "/groups/4", "type": "grouped_light" }),
            json!({ "id": "g5", "id_v1": "/groups/5", "type": "grouped_light" }),
        ],
        1,
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/api/app-key/rules"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "1": {
                "conditions": [{ "address": "/sensors/12/state/buttonevent", "operator": "eq", "value": "21" }],
                "actions": [{ "address": "/groups/3/action", "method": "PUT", "body": { "on": true } }],
            },
            "2": {
                "conditions": [{ "address": "/sensors/12/state/buttonevent", "operator": "eq", "value": "20" }],
                "actions": [{ "address": "/groups/4/action", "method": "PUT", "body": { "on": false } }],
            },
        })))
        .mount(&server)
        .await;
    hub.refresh().await.unwrap();

    let button = Button::from_resource(hub.resource("b1").unwrap()).unwrap();

    let own: Vec<String> = button
        .grouped_lights(Some(1))
        .await
        .unwrap()
        .iter()
        .map(|g| g.id().to_owned())
        .collect();
    assert_eq!(own, vec!["g3"]);

    let mut all: Vec<String> = button
        .grouped_lights(None)
        .await
        .unwrap()
        .iter()
        .map(|g| g.id().to_owned())
        .collect();
    all.sort();
    assert_eq!(all, vec!["g3", "g4"]);
}
