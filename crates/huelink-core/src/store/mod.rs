// ── Resource store ──
//
// Canonical id → resource map for one bridge. Lookups never duplicate an
// instance: concurrent creators race on the map entry and the loser's
// data is merged into the winner.

mod refresh;

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Value, json};
use tokio::sync::watch;

use huelink_api::BridgeClient;

use crate::config::HubConfig;
use crate::error::CoreError;
use crate::model::button::SwitchPosition;
use crate::model::kind::{KindRegistry, ResourceKind};
use crate::model::reference::Reference;
use crate::model::resource::Resource;
use crate::update::{Batch, Update, UpdateClass, gentle_merge};

// ── StoreSettings ────────────────────────────────────────────────────

/// Store-wide tuning that resources and views read back.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub long_press_threshold: Duration,
    pub button_stale_after: Duration,
    /// Transition time for commands that don't specify one.
    pub default_duration: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

impl From<&HubConfig> for StoreSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            long_press_threshold: config.long_press_threshold,
            button_stale_after: config.button_stale_after,
            default_duration: config.default_duration,
        }
    }
}

// ── Query ────────────────────────────────────────────────────────────

/// Exact-match conjunction over top-level resource fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    fields: Vec<(String, Value)>,
}

impl Query {
    /// Matches every resource.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_type(rtype: &str) -> Self {
        Self::new().field("type", rtype)
    }

    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    pub fn matches(&self, info: &Value) -> bool {
        self.fields
            .iter()
            .all(|(key, expected)| info.get(key) == Some(expected))
    }
}

// ── ResourceStore ────────────────────────────────────────────────────

pub struct ResourceStore {
    me: Weak<ResourceStore>,
    client: Arc<BridgeClient>,
    resources: DashMap<String, Arc<Resource>>,
    kinds: KindRegistry,
    settings: StoreSettings,
    last_refresh: watch::Sender<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore")
            .field("resources", &self.resources.len())
            .field("last_refresh", &self.last_refresh())
            .finish_non_exhaustive()
    }
}

impl ResourceStore {
    pub fn new(client: Arc<BridgeClient>, kinds: KindRegistry, settings: StoreSettings) -> Arc<Self> {
        let (last_refresh, _) = watch::channel(None);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            client,
            resources: DashMap::new(),
            kinds,
            settings,
            last_refresh,
        })
    }

    pub fn client(&self) -> &Arc<BridgeClient> {
        &self.client
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    // ── Lookups ──────────────────────────────────────────────────────

    /// The cached resource with `id`. Never does I/O.
    pub fn get(&self, id: &str) -> Option<Arc<Resource>> {
        self.resources.get(id).map(|r| Arc::clone(r.value()))
    }

    pub fn all(&self) -> Vec<Arc<Resource>> {
        self.resources.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Cached resources matching `query`.
    pub fn find(&self, query: &Query) -> Vec<Arc<Resource>> {
        self.find_where(query, |_| true)
    }

    /// Cached resources matching `query` and `filter`.
    pub fn find_where(
        &self,
        query: &Query,
        filter: impl Fn(&Resource) -> bool,
    ) -> Vec<Arc<Resource>> {
        // Collect first so `filter` never runs while a shard lock is held.
        self.all()
            .into_iter()
            .filter(|r| r.with_info(|info| query.matches(info)))
            .filter(|r| filter(r))
            .collect()
    }

    // ── Resolution ───────────────────────────────────────────────────

    /// The canonical resource for `reference`, fetching it once if unseen.
    ///
    /// When a concurrent resolve registers the same id first, the fetched
    /// data is merged only while that resource is still at sequence 0.
    pub async fn resolve(&self, reference: &Reference) -> Result<Arc<Resource>, CoreError> {
        if let Some(existing) = self.get(&reference.rid) {
            return Ok(existing);
        }

        tracing::debug!(%reference, "resolving unseen resource");
        let data = self.client.get_v2(&reference.endpoint()).await?;

        let placeholder = json!({ "id": reference.rid, "type": reference.rtype });
        let info = match data.first() {
            Some(fetched) => gentle_merge(&placeholder, fetched),
            None => placeholder,
        };
        Ok(self
            .insert_or_merge(reference.clone(), info, &Batch::fetch().expecting(0))
            .0)
    }

    /// Resolve a reference given as JSON (`{id, type}` or `{rid, rtype}`).
    pub async fn resolve_value(&self, value: &Value) -> Result<Arc<Resource>, CoreError> {
        self.resolve(&Reference::from_value(value)?).await
    }

    /// Register a resource built from `info`, or merge into the one that
    /// got there first. Returns the canonical instance and whether it was created.
    pub(crate) fn insert_or_merge(
        &self,
        reference: Reference,
        info: Value,
        batch: &Batch,
    ) -> (Arc<Resource>, bool) {
        let kind = self.kinds.classify(&reference.rtype, &info);
        let existing = match self.resources.entry(reference.rid.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let resource = Arc::new(Resource::new(reference, kind, info, self.me.clone()));
                entry.insert(Arc::clone(&resource));
                return (resource, true);
            }
        };

        self.apply(&existing, batch, &info);
        (existing, false)
    }

    // ── Updates ──────────────────────────────────────────────────────

    /// How updates to `resource` are interpreted.
    ///
    /// Buttons owned by a four-button switch get their position. Uses only
    /// cached owners; the answer is memoized once the owner is known.
    pub fn update_class(&self, resource: &Resource) -> UpdateClass {
        if resource.kind() != ResourceKind::Button {
            return UpdateClass::Generic;
        }
        if let Some(class) = resource.update_class.get() {
            return *class;
        }

        let Some(owner_ref) = resource.owner_ref() else {
            return *resource.update_class.get_or_init(|| UpdateClass::Button);
        };
        let Some(owner) = self.get(&owner_ref.rid) else {
            return UpdateClass::Button;
        };

        let position = resource
            .pointer("/metadata/control_id")
            .and_then(|v| v.as_u64())
            .and_then(SwitchPosition::from_control_id);
        let class = match (owner.kind(), position) {
            (ResourceKind::FourButtonSwitch, Some(position)) => UpdateClass::SwitchButton(position),
            _ => UpdateClass::Button,
        };
        *resource.update_class.get_or_init(|| class)
    }

    /// Merge `payload` into `resource` through the update engine.
    pub fn apply(
        &self,
        resource: &Arc<Resource>,
        batch: &Batch,
        payload: &Value,
    ) -> Option<Arc<Update>> {
        let class = self.update_class(resource);
        Update::apply(
            resource,
            batch,
            payload,
            class,
            self.settings.long_press_threshold,
        )
    }

    /// Apply one `data` item from a stream message.
    ///
    /// Unseen resources are fetched first. A button's owner is resolved
    /// before the update so switch buttons are classified correctly.
    pub async fn apply_stream_item(
        &self,
        batch: &Batch,
        item: &Value,
    ) -> Result<Option<Arc<Update>>, CoreError> {
        let resource = self.resolve_value(item).await?;

        if resource.kind() == ResourceKind::Button && resource.update_class.get().is_none() {
            if let Err(e) = resource.owner().await {
                tracing::debug!(id = resource.id(), error = %e, "button owner unavailable");
            }
        }

        Ok(self.apply(&resource, batch, item))
    }

    // ── Refresh bookkeeping ──────────────────────────────────────────

    /// Completion time of the last successful full refresh.
    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh.borrow()
    }

    pub fn subscribe_refresh(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.last_refresh.subscribe()
    }

    /// Resources whose cached state may be outdated at `now`.
    pub fn stale(&self, now: DateTime<Utc>) -> Vec<Arc<Resource>> {
        self.all()
            .into_iter()
            .filter(|r| r.is_stale_at(now, self.settings.button_stale_after))
            .collect()
    }
}
