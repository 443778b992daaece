// ── Hub abstraction ──
//
// Owns everything for one bridge: the client, the resource store, the
// event-stream consumer, and the scheduler. Cheap to clone. Background
// loops hold only a weak reference, so dropping the last `Hub` stops them.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde_json::Value;
use strum::{AsRefStr, Display};
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

use huelink_api::{BridgeClient, EventStreamHandle, Method, RequestOptions, StreamEvent, StreamMessage};

use crate::config::{BridgeCredentials, HubConfig};
use crate::error::CoreError;
use crate::lifecycle::{Lifecycle, LifecycleToken};
use crate::model::kind::KindRegistry;
use crate::model::reference::Reference;
use crate::model::resource::Resource;
use crate::model::views::{
    Button, Device, GroupedLight, Light, Room, Scene, ZigbeeConnectivity, Zone,
};
use crate::scheduler::{self, RefreshBackoff, TaskTable};
use crate::store::{Query, ResourceStore, StoreSettings};
use crate::update::{Batch, Update};
use crate::watch::{WatchHandle, WatcherList};

const EVENT_CHANNEL_SIZE: usize = 256;

// ── HubEvent ─────────────────────────────────────────────────────────

/// What hub-level watchers and [`Hub::events`] subscribers receive.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// A change applied to one resource, from any source.
    Update(Arc<Update>),
    /// A full refresh finished.
    Refreshed {
        at: DateTime<Utc>,
        resources: usize,
    },
    StreamConnected,
    StreamDisconnected { reason: String },
}

/// Filter discriminator for [`Hub::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Update,
    Refresh,
    Connection,
}

impl HubEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Update(_) => EventKind::Update,
            Self::Refreshed { .. } => EventKind::Refresh,
            Self::StreamConnected | Self::StreamDisconnected { .. } => EventKind::Connection,
        }
    }

    pub fn as_update(&self) -> Option<&Arc<Update>> {
        match self {
            Self::Update(update) => Some(update),
            _ => None,
        }
    }
}

// ── Hub ──────────────────────────────────────────────────────────────

/// The entry point for one bridge.
///
/// Cheaply cloneable via `Arc<HubInner>`. Call [`activate`](Self::activate)
/// to load the resource graph and start background sync.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

pub(crate) struct HubInner {
    pub(crate) credentials: BridgeCredentials,
    pub(crate) config: HubConfig,
    pub(crate) client: Arc<BridgeClient>,
    pub(crate) store: Arc<ResourceStore>,
    watchers: WatcherList<HubEvent>,
    event_tx: broadcast::Sender<HubEvent>,
    stream: Lifecycle,
    scheduler: Lifecycle,
    pub(crate) tasks: TaskTable,
    pub(crate) refresh_backoff: RefreshBackoff,
    activation: Mutex<()>,
}

impl Drop for HubInner {
    fn drop(&mut self) {
        self.stream.stop();
        self.scheduler.stop();
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("hostname", &self.inner.credentials.hostname)
            .field("active", &self.is_active())
            .field("resources", &self.inner.store.len())
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Create a hub for the bridge described by `credentials`. Does not
    /// connect; call [`activate`](Self::activate).
    pub fn new(credentials: BridgeCredentials, config: HubConfig) -> Result<Self, CoreError> {
        Self::with_kinds(credentials, config, KindRegistry::standard())
    }

    /// Like [`new`](Self::new), with a custom type registry.
    pub fn with_kinds(
        credentials: BridgeCredentials,
        config: HubConfig,
        kinds: KindRegistry,
    ) -> Result<Self, CoreError> {
        let transport = config.transport();
        let key = credentials.application_key.clone();
        let client = match &config.base_url {
            Some(url) => BridgeClient::new(url.clone(), key, &transport)?,
            None => BridgeClient::for_host(&credentials.hostname, key, &transport)?,
        };
        let client = Arc::new(client);
        let store = ResourceStore::new(Arc::clone(&client), kinds, StoreSettings::from(&config));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        Ok(Self {
            inner: Arc::new(HubInner {
                credentials,
                config,
                client,
                store,
                watchers: WatcherList::default(),
                event_tx,
                stream: Lifecycle::new(),
                scheduler: Lifecycle::new(),
                tasks: TaskTable::default(),
                refresh_backoff: RefreshBackoff::default(),
                activation: Mutex::new(()),
            }),
        })
    }

    pub(crate) fn inner(&self) -> &HubInner {
        &self.inner
    }

    pub(crate) fn upgrade(weak: &Weak<HubInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn hostname(&self) -> &str {
        &self.inner.credentials.hostname
    }

    pub fn bridge_id(&self) -> Option<&str> {
        self.inner.credentials.bridge_id.as_deref()
    }

    pub fn credentials(&self) -> &BridgeCredentials {
        &self.inner.credentials
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn client(&self) -> &Arc<BridgeClient> {
        &self.inner.client
    }

    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.inner.store
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start the event stream, load every resource, then start the scheduler.
    ///
    /// A no-op while already active. If the initial refresh fails the
    /// stream is stopped again and the error returned.
    pub async fn activate(&self) -> Result<(), CoreError> {
        let _guard = self.inner.activation.lock().await;
        if self.is_active() {
            return Ok(());
        }

        self.start_stream();
        if let Err(e) = self.refresh().await {
            self.inner.stream.stop();
            warn!(hostname = self.hostname(), error = %e, "activation failed");
            return Err(e);
        }

        let token = self.inner.scheduler.start();
        tokio::spawn(scheduler::scheduler_loop(
            Arc::downgrade(&self.inner),
            token,
            self.inner.config.tick_interval,
        ));

        info!(
            hostname = self.hostname(),
            resources = self.inner.store.len(),
            "hub active"
        );
        Ok(())
    }

    /// Stop background sync. Idempotent. In-flight work finishes on its own
    /// but its results are no longer acted on.
    pub async fn deactivate(&self) {
        let _guard = self.inner.activation.lock().await;
        if !self.is_active() && !self.inner.stream.is_running() {
            return;
        }
        self.inner.stream.stop();
        self.inner.scheduler.stop();
        info!(hostname = self.hostname(), "hub inactive");
    }

    pub fn is_active(&self) -> bool {
        self.inner.scheduler.is_running()
    }

    fn start_stream(&self) {
        let token = self.inner.stream.start();
        let (_handle, events) = EventStreamHandle::spawn(
            Arc::clone(&self.inner.client),
            self.inner.config.reconnect(),
            token.cancellation_token(),
        );
        tokio::spawn(stream_consumer(Arc::downgrade(&self.inner), events, token));
    }

    // ── Events ───────────────────────────────────────────────────────

    /// Call `callback` for every hub event whose kind is in `kinds`
    /// (every event when `kinds` is empty).
    pub fn watch(
        &self,
        kinds: &[EventKind],
        callback: impl Fn(&HubEvent) + Send + Sync + 'static,
    ) -> WatchHandle {
        if kinds.is_empty() {
            return self.inner.watchers.watch(callback);
        }
        let kinds = kinds.to_vec();
        self.inner
            .watchers
            .watch_filtered(move |event: &HubEvent| kinds.contains(&event.kind()), callback)
    }

    /// Subscribe to hub events. Slow receivers lag rather than block.
    pub fn events(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.event_tx.subscribe()
    }

    pub(crate) fn publish(&self, event: HubEvent) {
        self.inner.watchers.notify(&event);
        let _ = self.inner.event_tx.send(event);
    }

    pub(crate) fn publish_update(&self, update: &Arc<Update>) {
        self.publish(HubEvent::Update(Arc::clone(update)));
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Cached resources matching `query`. Never does I/O.
    pub fn find(&self, query: &Query) -> Vec<Arc<Resource>> {
        self.inner.store.find(query)
    }

    pub fn find_where(
        &self,
        query: &Query,
        filter: impl Fn(&Resource) -> bool,
    ) -> Vec<Arc<Resource>> {
        self.inner.store.find_where(query, filter)
    }

    /// The cached resource with `id`.
    pub fn resource(&self, id: &str) -> Option<Arc<Resource>> {
        self.inner.store.get(id)
    }

    fn views<T>(&self, rtype: &str, view: fn(Arc<Resource>) -> Option<T>) -> Vec<T> {
        self.find(&Query::of_type(rtype))
            .into_iter()
            .filter_map(view)
            .collect()
    }

    pub fn lights(&self) -> Vec<Light> {
        self.views("light", Light::from_resource)
    }

    pub fn grouped_lights(&self) -> Vec<GroupedLight> {
        self.views("grouped_light", GroupedLight::from_resource)
    }

    pub fn scenes(&self) -> Vec<Scene> {
        self.views("scene", Scene::from_resource)
    }

    pub fn devices(&self) -> Vec<Device> {
        self.views("device", Device::from_resource)
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.views("room", Room::from_resource)
    }

    pub fn zones(&self) -> Vec<Zone> {
        self.views("zone", Zone::from_resource)
    }

    pub fn buttons(&self) -> Vec<Button> {
        self.views("button", Button::from_resource)
    }

    pub fn zigbee_connectivity(&self) -> Vec<ZigbeeConnectivity> {
        self.views("zigbee_connectivity", ZigbeeConnectivity::from_resource)
    }

    pub fn bridges(&self) -> Vec<Arc<Resource>> {
        self.find(&Query::of_type("bridge"))
    }

    pub fn bridge_homes(&self) -> Vec<Arc<Resource>> {
        self.find(&Query::of_type("bridge_home"))
    }

    // ── Synchronization ──────────────────────────────────────────────

    /// Fetch every resource and merge it into the cache.
    pub async fn refresh(&self) -> Result<Vec<Arc<Update>>, CoreError> {
        let updates = self.inner.store.refresh().await?;
        for update in &updates {
            self.publish_update(update);
        }
        self.publish(HubEvent::Refreshed {
            at: self.inner.store.last_refresh().unwrap_or_else(Utc::now),
            resources: self.inner.store.len(),
        });
        Ok(updates)
    }

    /// Completion time of the last successful full refresh.
    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.inner.store.last_refresh()
    }

    pub async fn resolve(&self, reference: &Reference) -> Result<Arc<Resource>, CoreError> {
        self.inner.store.resolve(reference).await
    }

    pub async fn resolve_value(&self, value: &Value) -> Result<Arc<Resource>, CoreError> {
        self.inner.store.resolve_value(value).await
    }

    /// Run one scheduler pass in the caller's task.
    pub async fn tick(&self) {
        scheduler::run_pass(self).await;
    }

    // ── Tasks ────────────────────────────────────────────────────────

    /// Run `callback` every `interval`, starting on the next pass.
    /// Registering an existing id replaces that task.
    pub fn task<F, Fut>(&self, id: impl Into<String>, interval: Duration, callback: F)
    where
        F: Fn(Hub) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        let id = id.into();
        debug!(task = %id, ?interval, "registering task");
        self.inner
            .tasks
            .insert(id, interval, Arc::new(move |hub: Hub| callback(hub).boxed()));
    }

    /// Remove a task. Returns whether it existed.
    pub fn end_task(&self, id: &str) -> bool {
        self.inner.tasks.remove(id)
    }

    pub fn has_task(&self, id: &str) -> bool {
        self.inner.tasks.contains(id)
    }

    /// Registered task ids, sorted.
    pub fn tasks(&self) -> Vec<String> {
        self.inner.tasks.ids()
    }

    // ── Raw requests ─────────────────────────────────────────────────

    pub async fn request_v2(
        &self,
        method: Method,
        endpoint: &str,
        payload: Option<&Value>,
        options: &RequestOptions,
    ) -> Result<Vec<Value>, CoreError> {
        Ok(self
            .inner
            .client
            .request_v2(method, endpoint, payload, options)
            .await?)
    }

    pub async fn get_v2(&self, endpoint: &str) -> Result<Vec<Value>, CoreError> {
        Ok(self.inner.client.get_v2(endpoint).await?)
    }

    pub async fn put_v2(&self, endpoint: &str, payload: &Value) -> Result<Vec<Value>, CoreError> {
        Ok(self.inner.client.put_v2(endpoint, payload).await?)
    }

    pub async fn post_v2(&self, endpoint: &str, payload: &Value) -> Result<Vec<Value>, CoreError> {
        Ok(self.inner.client.post_v2(endpoint, payload).await?)
    }

    pub async fn delete_v2(&self, endpoint: &str) -> Result<Vec<Value>, CoreError> {
        Ok(self.inner.client.delete_v2(endpoint).await?)
    }

    pub async fn request_v1(
        &self,
        method: Method,
        endpoint: &str,
        payload: Option<&Value>,
        options: &RequestOptions,
    ) -> Result<Value, CoreError> {
        Ok(self
            .inner
            .client
            .request_v1(method, endpoint, payload, options)
            .await?)
    }

    pub async fn get_v1(&self, endpoint: &str) -> Result<Value, CoreError> {
        Ok(self.inner.client.get_v1(endpoint).await?)
    }

    pub async fn put_v1(&self, endpoint: &str, payload: &Value) -> Result<Value, CoreError> {
        Ok(self.inner.client.put_v1(endpoint, payload).await?)
    }

    pub async fn post_v1(&self, endpoint: &str, payload: &Value) -> Result<Value, CoreError> {
        Ok(self.inner.client.post_v1(endpoint, payload).await?)
    }

    pub async fn delete_v1(&self, endpoint: &str) -> Result<Value, CoreError> {
        Ok(self.inner.client.delete_v1(endpoint).await?)
    }

    /// All rules known to the bridge's v1 API.
    pub async fn rules_v1(&self) -> Result<Value, CoreError> {
        Ok(self.inner.client.rules_v1().await?)
    }

    // ── Stream application ───────────────────────────────────────────

    /// Apply stream messages to the store, stopping early if `token` goes stale.
    async fn apply_messages(&self, messages: &[StreamMessage], token: &LifecycleToken) {
        for message in messages {
            if !message.is_update() {
                debug!(kind = %message.kind, id = %message.id, "ignoring stream message");
                continue;
            }
            let batch = Batch::stream(message);
            for item in &message.data {
                if !token.is_current() {
                    return;
                }
                match self.inner.store.apply_stream_item(&batch, item).await {
                    Ok(Some(update)) => self.publish_update(&update),
                    Ok(None) => {}
                    Err(e) => warn!(batch = %message.id, error = %e, "dropping stream item"),
                }
            }
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Feed event-stream output into the hub until `token` goes stale.
async fn stream_consumer(
    weak: Weak<HubInner>,
    mut events: mpsc::Receiver<StreamEvent>,
    token: LifecycleToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = token.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        if !token.is_current() {
            break;
        }
        let Some(hub) = Hub::upgrade(&weak) else {
            break;
        };

        match event {
            StreamEvent::Connected => {
                info!(hostname = hub.hostname(), "event stream connected");
                hub.publish(HubEvent::StreamConnected);
            }
            StreamEvent::Disconnected { reason } => {
                debug!(hostname = hub.hostname(), %reason, "event stream disconnected");
                hub.publish(HubEvent::StreamDisconnected { reason });
            }
            StreamEvent::Messages(messages) => hub.apply_messages(&messages, &token).await,
        }
    }
    debug!(generation = token.generation(), "stream consumer stopped");
}
