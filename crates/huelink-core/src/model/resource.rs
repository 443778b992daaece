// ── Resource ──
//
// One bridge-managed object. The store owns the canonical `Arc` per id;
// property reads return snapshots, and the only writer is the update
// engine's merge step.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use huelink_api::RequestOptions;

use crate::error::CoreError;
use crate::model::button::PressState;
use crate::model::kind::ResourceKind;
use crate::model::reference::Reference;
use crate::store::{ResourceStore, StoreSettings};
use crate::update::{Update, UpdateClass};
use crate::watch::{WatchHandle, WatcherList};

#[derive(Debug)]
pub(crate) struct ResourceState {
    pub(crate) info: Value,
    pub(crate) sequence: u64,
    pub(crate) last_update: Option<Arc<Update>>,
    pub(crate) last_update_at: Option<DateTime<Utc>>,
    /// Last time a fetch confirmed this state, changed or not.
    pub(crate) checked_at: Option<DateTime<Utc>>,
    pub(crate) press: PressState,
}

pub struct Resource {
    reference: Reference,
    kind: ResourceKind,
    pub(crate) state: RwLock<ResourceState>,
    /// Held from merge through watcher delivery so notification order
    /// matches application order.
    pub(crate) delivery: Mutex<()>,
    pub(crate) watchers: WatcherList<Arc<Update>>,
    owner: OnceLock<Arc<Resource>>,
    pub(crate) update_class: OnceLock<UpdateClass>,
    /// Memoized button ids by switch position (four-button switches only).
    pub(crate) control_links: [OnceLock<String>; 4],
    store: Weak<ResourceStore>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.reference.rid)
            .field("type", &self.reference.rtype)
            .field("kind", &self.kind)
            .field("sequence", &self.sequence())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.reference.rtype, self.reference.rid)?;
        if let Some(name) = self.name() {
            write!(f, " '{name}'")?;
        }
        Ok(())
    }
}

impl Resource {
    pub(crate) fn new(
        reference: Reference,
        kind: ResourceKind,
        info: Value,
        store: Weak<ResourceStore>,
    ) -> Self {
        Self {
            reference,
            kind,
            state: RwLock::new(ResourceState {
                info,
                sequence: 0,
                last_update: None,
                last_update_at: None,
                checked_at: None,
                press: PressState::default(),
            }),
            delivery: Mutex::new(()),
            watchers: WatcherList::default(),
            owner: OnceLock::new(),
            update_class: OnceLock::new(),
            control_links: Default::default(),
            store,
        }
    }

    /// A resource not attached to any store. Requests through it fail
    /// with [`CoreError::HubDropped`].
    pub fn detached(reference: Reference, kind: ResourceKind, info: Value) -> Arc<Self> {
        Arc::new(Self::new(reference, kind, info, Weak::new()))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ResourceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Identity ─────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.reference.rid
    }

    /// The bridge's `type` discriminator.
    pub fn rtype(&self) -> &str {
        &self.reference.rtype
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// v2 endpoint, relative to `/clip/v2`.
    pub fn endpoint(&self) -> String {
        self.reference.endpoint()
    }

    // ── Properties ───────────────────────────────────────────────────

    /// Snapshot of the whole property bag.
    pub fn info(&self) -> Value {
        self.read().info.clone()
    }

    /// Run `f` against the current properties without cloning them.
    pub fn with_info<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.read().info)
    }

    /// Top-level property by key.
    pub fn field(&self, key: &str) -> Option<Value> {
        self.with_info(|info| info.get(key).cloned())
    }

    /// Nested property by JSON pointer (`/dimming/brightness`).
    pub fn pointer(&self, pointer: &str) -> Option<Value> {
        self.with_info(|info| info.pointer(pointer).cloned())
    }

    fn pointer_str(&self, pointer: &str) -> Option<String> {
        self.with_info(|info| info.pointer(pointer).and_then(Value::as_str).map(str::to_owned))
    }

    /// `metadata.name`.
    pub fn name(&self) -> Option<String> {
        self.pointer_str("/metadata/name")
    }

    /// Legacy v1 path, e.g. `/lights/3`.
    pub fn id_v1(&self) -> Option<String> {
        self.pointer_str("/id_v1")
    }

    /// References listed under `key` (`children`, `services`, ...).
    pub fn references(&self, key: &str) -> Vec<Reference> {
        self.with_info(|info| Reference::list(info.get(key)))
    }

    pub fn owner_ref(&self) -> Option<Reference> {
        self.with_info(|info| info.get("owner").and_then(|v| Reference::from_value(v).ok()))
    }

    // ── Update bookkeeping ───────────────────────────────────────────

    pub fn sequence(&self) -> u64 {
        self.read().sequence
    }

    pub fn last_update(&self) -> Option<Arc<Update>> {
        self.read().last_update.clone()
    }

    pub fn last_update_at(&self) -> Option<DateTime<Utc>> {
        self.read().last_update_at
    }

    pub(crate) fn mark_checked(&self, at: DateTime<Utc>) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .checked_at = Some(at);
    }

    // ── Button state ─────────────────────────────────────────────────

    pub fn press_state(&self) -> PressState {
        self.read().press.clone()
    }

    pub fn is_pressed(&self) -> bool {
        self.read().press.is_pressed()
    }

    pub fn last_hold(&self) -> Option<Duration> {
        self.read().press.last_hold()
    }

    // ── Staleness ────────────────────────────────────────────────────

    /// Whether the cached state may be outdated at `now`.
    ///
    /// Only buttons go stale: a button still held whose cached state is
    /// older than `button_stale_after`.
    ///
    /// Age is measured from the later of the last applied update and the
    /// last time the bridge was queried for this resource (`mark_checked`).
    /// A fetch that finds the button still held therefore resets the clock
    /// even though it changed nothing.
    pub fn is_stale_at(&self, now: DateTime<Utc>, button_stale_after: Duration) -> bool {
        if self.kind != ResourceKind::Button {
            return false;
        }
        let state = self.read();
        if !state.press.is_pressed() {
            return false;
        }
        let Some(seen) = state.last_update_at.max(state.checked_at) else {
            return true;
        };
        (now - seen)
            .to_std()
            .is_ok_and(|age| age > button_stale_after)
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now(), self.settings().button_stale_after)
    }

    // ── Watchers ─────────────────────────────────────────────────────

    /// Call `callback` with every update applied to this resource.
    pub fn watch(&self, callback: impl Fn(&Arc<Update>) + Send + Sync + 'static) -> WatchHandle {
        self.watchers.watch(callback)
    }

    /// Like [`watch`](Self::watch), replacing any earlier watcher registered under `key`.
    pub fn watch_keyed(
        &self,
        key: impl Into<String>,
        callback: impl Fn(&Arc<Update>) + Send + Sync + 'static,
    ) -> WatchHandle {
        self.watchers.watch_keyed(key, callback)
    }

    // ── Bridge I/O ───────────────────────────────────────────────────

    pub fn store(&self) -> Result<Arc<ResourceStore>, CoreError> {
        self.store.upgrade().ok_or(CoreError::HubDropped)
    }

    pub(crate) fn settings(&self) -> StoreSettings {
        self.store
            .upgrade()
            .map(|store| store.settings().clone())
            .unwrap_or_default()
    }

    /// The resource named by `owner`, resolved once and memoized.
    pub async fn owner(&self) -> Result<Option<Arc<Resource>>, CoreError> {
        if let Some(owner) = self.owner.get() {
            return Ok(Some(Arc::clone(owner)));
        }
        let Some(reference) = self.owner_ref() else {
            return Ok(None);
        };
        let owner = self.store()?.resolve(&reference).await?;
        Ok(Some(Arc::clone(self.owner.get_or_init(|| owner))))
    }

    /// Resolve every reference listed under `key`.
    pub async fn resolve_all(&self, key: &str) -> Result<Vec<Arc<Resource>>, CoreError> {
        let store = self.store()?;
        let mut resolved = Vec::new();
        for reference in self.references(key) {
            resolved.push(store.resolve(&reference).await?);
        }
        Ok(resolved)
    }

    /// `GET` this resource's endpoint.
    pub async fn get(&self) -> Result<Vec<Value>, CoreError> {
        Ok(self.store()?.client().get_v2(&self.endpoint()).await?)
    }

    /// `PUT` a change to this resource's endpoint.
    pub async fn put(&self, payload: &Value) -> Result<Vec<Value>, CoreError> {
        self.put_with(payload, &RequestOptions::default()).await
    }

    pub async fn put_with(
        &self,
        payload: &Value,
        options: &RequestOptions,
    ) -> Result<Vec<Value>, CoreError> {
        Ok(self
            .store()?
            .client()
            .request_v2(huelink_api::Method::PUT, &self.endpoint(), Some(payload), options)
            .await?)
    }

    pub async fn delete(&self) -> Result<Vec<Value>, CoreError> {
        Ok(self.store()?.client().delete_v2(&self.endpoint()).await?)
    }

    /// Fetch this resource and merge the result.
    pub async fn refresh(self: &Arc<Self>) -> Result<Option<Arc<Update>>, CoreError> {
        self.store()?.refresh_resource(self).await
    }
}
