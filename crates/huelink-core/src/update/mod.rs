// ── Update engine ──
//
// One incoming change → gentle merge into one resource → one immutable
// `Update`. Identical merges produce nothing. Button resources also fold
// the change into their press state and get a typed detail.

pub mod merge;

use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use strum::{AsRefStr, Display};

use huelink_api::StreamMessage;

use crate::model::button::{ButtonEvent, ButtonUpdate, SwitchPosition};
use crate::model::resource::Resource;

pub use merge::gentle_merge;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum UpdateSource {
    /// A message on the event stream.
    Stream,
    /// A full refresh of every resource.
    Refresh,
    /// A fetch of one resource.
    Fetch,
}

/// Batch metadata shared by every update built from one message or refresh.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub source: UpdateSource,
    /// Apply only if the resource is still at this sequence.
    pub expected_sequence: Option<u64>,
}

impl Batch {
    pub fn stream(message: &StreamMessage) -> Self {
        Self {
            id: Some(message.id.clone()),
            creation_time: message.creation_time(),
            source: UpdateSource::Stream,
            expected_sequence: None,
        }
    }

    pub fn refresh() -> Self {
        Self {
            id: None,
            creation_time: None,
            source: UpdateSource::Refresh,
            expected_sequence: None,
        }
    }

    pub fn fetch() -> Self {
        Self {
            id: None,
            creation_time: None,
            source: UpdateSource::Fetch,
            expected_sequence: None,
        }
    }

    /// This batch, guarded against changes made after `sequence` was read.
    #[must_use]
    pub fn expecting(&self, sequence: u64) -> Self {
        Self {
            expected_sequence: Some(sequence),
            ..self.clone()
        }
    }
}

/// How an update to a given resource is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateClass {
    Generic,
    Button,
    /// A button owned by a four-button wall switch.
    SwitchButton(SwitchPosition),
}

/// Type-specific meaning of an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDetail {
    Generic,
    Button(ButtonUpdate),
    SwitchButton {
        position: SwitchPosition,
        button: ButtonUpdate,
    },
}

impl UpdateDetail {
    pub fn button(&self) -> Option<&ButtonUpdate> {
        match self {
            Self::Generic => None,
            Self::Button(button) | Self::SwitchButton { button, .. } => Some(button),
        }
    }

    pub fn position(&self) -> Option<SwitchPosition> {
        match self {
            Self::SwitchButton { position, .. } => Some(*position),
            _ => None,
        }
    }
}

/// Immutable record of one applied change.
#[derive(Debug)]
pub struct Update {
    resource: Weak<Resource>,
    resource_id: String,
    resource_type: String,
    batch_id: Option<String>,
    payload: Value,
    old_state: Value,
    sequence: u64,
    creation_time: Option<DateTime<Utc>>,
    received_time: DateTime<Utc>,
    source: UpdateSource,
    detail: UpdateDetail,
}

impl Update {
    /// Merge `payload` into `resource`, stamped with the current time.
    pub fn apply(
        resource: &Arc<Resource>,
        batch: &Batch,
        payload: &Value,
        class: UpdateClass,
        long_press_threshold: Duration,
    ) -> Option<Arc<Self>> {
        Self::apply_at(resource, batch, payload, class, long_press_threshold, Utc::now())
    }

    /// Merge `payload` into `resource` as if received at `received_time`.
    ///
    /// Returns `None` when the merge changes nothing, or when the batch
    /// expects a sequence the resource has already moved past. Otherwise advances
    /// the resource's sequence, records the update on it, and notifies the
    /// resource's watchers before returning. Watchers must not apply
    /// updates to the same resource.
    pub fn apply_at(
        resource: &Arc<Resource>,
        batch: &Batch,
        payload: &Value,
        class: UpdateClass,
        long_press_threshold: Duration,
        received_time: DateTime<Utc>,
    ) -> Option<Arc<Self>> {
        let _delivery = resource
            .delivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let update = {
            let mut state = resource.state.write().unwrap_or_else(PoisonError::into_inner);
            if batch
                .expected_sequence
                .is_some_and(|expected| expected != state.sequence)
            {
                return None;
            }

            let merged = gentle_merge(&state.info, payload);
            if merged == state.info {
                return None;
            }
            let event = match class {
                UpdateClass::Generic => None,
                UpdateClass::Button | UpdateClass::SwitchButton(_) => {
                    ButtonEvent::reported_change(&state.info, &merged)
                }
            };
            let old_state = std::mem::replace(&mut state.info, merged);
            state.sequence += 1;

            let detail = match (class, event) {
                (UpdateClass::Generic, _) | (_, None) => UpdateDetail::Generic,
                (UpdateClass::Button, Some(event)) => UpdateDetail::Button(
                    state.press.observe(event, received_time, long_press_threshold),
                ),
                (UpdateClass::SwitchButton(position), Some(event)) => UpdateDetail::SwitchButton {
                    position,
                    button: state.press.observe(event, received_time, long_press_threshold),
                },
            };

            let update = Arc::new(Self {
                resource: Arc::downgrade(resource),
                resource_id: resource.id().to_owned(),
                resource_type: resource.rtype().to_owned(),
                batch_id: batch.id.clone(),
                payload: payload.clone(),
                old_state,
                sequence: state.sequence,
                creation_time: batch.creation_time,
                received_time,
                source: batch.source,
                detail,
            });
            state.last_update = Some(Arc::clone(&update));
            state.last_update_at = Some(received_time);
            update
        };

        tracing::trace!(
            resource = %update.resource_type,
            id = %update.resource_id,
            sequence = update.sequence,
            source = %update.source,
            "applied update"
        );
        resource.watchers.notify(&update);
        Some(update)
    }

    /// The updated resource, unless it has since been dropped.
    pub fn resource(&self) -> Option<Arc<Resource>> {
        self.resource.upgrade()
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn batch_id(&self) -> Option<&str> {
        self.batch_id.as_deref()
    }

    /// The raw change fragment as received.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Resource state before this update.
    pub fn old_state(&self) -> &Value {
        &self.old_state
    }

    /// The resource's sequence number after this update.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn creation_time(&self) -> Option<DateTime<Utc>> {
        self.creation_time
    }

    pub fn received_time(&self) -> DateTime<Utc> {
        self.received_time
    }

    pub fn source(&self) -> UpdateSource {
        self.source
    }

    pub fn detail(&self) -> &UpdateDetail {
        &self.detail
    }

    /// Hold duration, for button releases.
    pub fn hold(&self) -> Option<Duration> {
        self.detail.button().and_then(|b| b.hold)
    }

    pub fn is_long_press(&self) -> bool {
        self.detail.button().is_some_and(|b| b.long_press)
    }
}
