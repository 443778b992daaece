// ── Typed views ──
//
// Thin wrappers around a cached `Arc<Resource>` that add the accessors
// and commands meaningful for one kind. Every view derefs to the
// resource, so the generic accessors stay available.

use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::oneshot;

use huelink_api::{IgnoreErrors, RequestOptions};

use crate::error::CoreError;
use crate::model::button::{ButtonEvent, SwitchPosition};
use crate::model::kind::ResourceKind;
use crate::model::reference::Reference;
use crate::model::resource::Resource;
use crate::store::{Query, ResourceStore};
use crate::update::gentle_merge;

macro_rules! resource_view {
    ($(#[$meta:meta])* $name:ident, $($kind:path)|+) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name(Arc<Resource>);

        impl $name {
            /// Wrap `resource` if its kind fits this view.
            pub fn from_resource(resource: Arc<Resource>) -> Option<Self> {
                if matches!(resource.kind(), $($kind)|+) {
                    Some(Self(resource))
                } else {
                    None
                }
            }

            pub fn resource(&self) -> &Arc<Resource> {
                &self.0
            }

            pub fn into_resource(self) -> Arc<Resource> {
                self.0
            }
        }

        impl Deref for $name {
            type Target = Resource;

            fn deref(&self) -> &Resource {
                &self.0
            }
        }
    };
}

resource_view!(Light, ResourceKind::Light);
resource_view!(
    /// The implicit light group of a room or zone.
    GroupedLight,
    ResourceKind::GroupedLight
);
resource_view!(Scene, ResourceKind::Scene);
resource_view!(
    /// Any device, including specialized ones.
    Device,
    ResourceKind::Device | ResourceKind::FourButtonSwitch
);
resource_view!(
    /// A device with four labeled buttons (`product_data.model_id == "FOHSWITCH"`).
    FourButtonSwitch,
    ResourceKind::FourButtonSwitch
);
resource_view!(Room, ResourceKind::Room);
resource_view!(Zone, ResourceKind::Zone);
resource_view!(Button, ResourceKind::Button);
resource_view!(ZigbeeConnectivity, ResourceKind::ZigbeeConnectivity);

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn resolve_as<T>(
    resources: Vec<Arc<Resource>>,
    view: impl Fn(Arc<Resource>) -> Option<T>,
) -> Vec<T> {
    resources.into_iter().filter_map(view).collect()
}

// ── Lights ───────────────────────────────────────────────────────────

/// Options shared by light commands.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Transition time. Defaults to the hub's default duration.
    pub duration: Option<Duration>,
    /// Effect speed, 0.0 to 1.0.
    pub speed: Option<f64>,
    /// Overrides the view's error policy.
    pub ignore_errors: Option<IgnoreErrors>,
}

impl CommandOptions {
    pub fn with_duration(duration: Duration) -> Self {
        Self {
            duration: Some(duration),
            ..Self::default()
        }
    }
}

async fn light_command(
    resource: &Resource,
    state: &Value,
    options: &CommandOptions,
    default_policy: IgnoreErrors,
) -> Result<Vec<Value>, CoreError> {
    let duration = options
        .duration
        .unwrap_or_else(|| resource.settings().default_duration);

    let mut dynamics = Map::new();
    dynamics.insert("duration".into(), json!(millis(duration)));
    if let Some(speed) = options.speed {
        dynamics.insert("speed".into(), json!(speed.clamp(0.0, 1.0)));
    }

    let message = gentle_merge(&json!({ "dynamics": dynamics }), state);
    let request = RequestOptions::ignoring(options.ignore_errors.unwrap_or(default_policy));
    resource.put_with(&message, &request).await
}

macro_rules! light_commands {
    ($name:ident, $policy:expr) => {
        impl $name {
            pub fn is_on(&self) -> Option<bool> {
                self.with_info(|info| info.pointer("/on/on").and_then(Value::as_bool))
            }

            /// Brightness in percent.
            pub fn brightness(&self) -> Option<f64> {
                self.with_info(|info| info.pointer("/dimming/brightness").and_then(Value::as_f64))
            }

            /// Send an arbitrary state change with a `dynamics` block.
            pub async fn command(
                &self,
                state: &Value,
                options: &CommandOptions,
            ) -> Result<Vec<Value>, CoreError> {
                light_command(self, state, options, $policy).await
            }

            pub async fn set_on(
                &self,
                on: bool,
                options: &CommandOptions,
            ) -> Result<Vec<Value>, CoreError> {
                self.command(&json!({ "on": { "on": on } }), options).await
            }

            /// Set brightness in percent (clamped to 0..=100).
            pub async fn set_brightness(
                &self,
                brightness: f64,
                options: &CommandOptions,
            ) -> Result<Vec<Value>, CoreError> {
                let brightness = brightness.clamp(0.0, 100.0).round();
                self.command(&json!({ "dimming": { "brightness": brightness } }), options)
                    .await
            }

            /// Set color as CIE xy coordinates.
            pub async fn set_xy(
                &self,
                x: f64,
                y: f64,
                options: &CommandOptions,
            ) -> Result<Vec<Value>, CoreError> {
                self.command(&json!({ "color": { "xy": { "x": x, "y": y } } }), options)
                    .await
            }

            /// Set color temperature in mirek.
            pub async fn set_mirek(
                &self,
                mirek: u16,
                options: &CommandOptions,
            ) -> Result<Vec<Value>, CoreError> {
                self.command(&json!({ "color_temperature": { "mirek": mirek } }), options)
                    .await
            }
        }
    };
}

light_commands!(Light, IgnoreErrors::Never);
// Grouped lights report spurious communication errors for unreachable members.
light_commands!(GroupedLight, IgnoreErrors::Communication);

impl Light {
    pub async fn owner_device(&self) -> Result<Option<Device>, CoreError> {
        Ok(self.owner().await?.and_then(Device::from_resource))
    }
}

impl GroupedLight {
    /// Member lights of the owning room or zone.
    pub async fn lights(&self) -> Result<Vec<Light>, CoreError> {
        let Some(group) = self.owner().await? else {
            return Ok(Vec::new());
        };
        let store = self.store()?;

        let mut lights = Vec::new();
        for child in group.references("children") {
            match child.rtype.as_str() {
                "light" => lights.extend(Light::from_resource(store.resolve(&child).await?)),
                "device" => {
                    let device = store.resolve(&child).await?;
                    for service in device.references("services") {
                        if service.rtype == "light" {
                            lights.extend(Light::from_resource(store.resolve(&service).await?));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(lights)
    }
}

// ── Scenes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RecallOptions {
    /// Transition time. Defaults to the hub's default duration.
    pub duration: Option<Duration>,
    /// Brightness override in percent.
    pub brightness: Option<f64>,
}

impl Scene {
    /// Activate the scene.
    pub async fn recall(&self, options: &RecallOptions) -> Result<Vec<Value>, CoreError> {
        let duration = options
            .duration
            .unwrap_or_else(|| self.settings().default_duration);

        let mut recall = json!({ "action": "active", "duration": millis(duration) });
        if let Some(brightness) = options.brightness {
            recall["dimming"] = json!({ "brightness": brightness });
        }
        self.put(&json!({ "recall": recall })).await
    }

    /// The room or zone this scene belongs to.
    pub fn group(&self) -> Option<Reference> {
        self.with_info(|info| {
            info.get("group")
                .and_then(|v| Reference::from_value(v).ok())
        })
    }
}

// ── Rooms and zones ──────────────────────────────────────────────────

fn owned_by(store: &ResourceStore, rtype: &str, pointer: &'static str, id: &str) -> Vec<Arc<Resource>> {
    store.find_where(&Query::of_type(rtype), |r| {
        r.with_info(|info| info.pointer(pointer).and_then(Value::as_str) == Some(id))
    })
}

macro_rules! group_queries {
    ($name:ident) => {
        impl $name {
            /// Grouped lights owned by this group.
            pub fn grouped_lights(&self) -> Result<Vec<GroupedLight>, CoreError> {
                let store = self.store()?;
                Ok(resolve_as(
                    owned_by(&store, "grouped_light", "/owner/rid", self.id()),
                    GroupedLight::from_resource,
                ))
            }

            /// Cached scenes belonging to this group.
            pub fn scenes(&self) -> Result<Vec<Scene>, CoreError> {
                let store = self.store()?;
                Ok(resolve_as(
                    owned_by(&store, "scene", "/group/rid", self.id()),
                    Scene::from_resource,
                ))
            }

            /// The first scene named `name`.
            pub fn scene(&self, name: &str) -> Result<Option<Scene>, CoreError> {
                Ok(self
                    .scenes()?
                    .into_iter()
                    .find(|scene| scene.name().as_deref() == Some(name)))
            }
        }
    };
}

group_queries!(Room);
group_queries!(Zone);

impl Room {
    pub async fn devices(&self) -> Result<Vec<Device>, CoreError> {
        let children = self.resolve_all("children").await?;
        Ok(resolve_as(children, Device::from_resource))
    }

    /// Lights provided by this room's devices.
    pub async fn lights(&self) -> Result<Vec<Light>, CoreError> {
        let mut lights = Vec::new();
        for device in self.devices().await? {
            lights.extend(resolve_as(device.service_resources().await?, Light::from_resource));
        }
        Ok(lights)
    }
}

impl Zone {
    /// Lights listed directly as zone children.
    pub async fn lights(&self) -> Result<Vec<Light>, CoreError> {
        let children = self.resolve_all("children").await?;
        Ok(resolve_as(children, Light::from_resource))
    }
}

// ── Devices ──────────────────────────────────────────────────────────

impl Device {
    pub fn services(&self) -> Vec<Reference> {
        self.references("services")
    }

    pub async fn service_resources(&self) -> Result<Vec<Arc<Resource>>, CoreError> {
        self.resolve_all("services").await
    }

    /// `product_data.model_id`.
    pub fn model_id(&self) -> Option<String> {
        self.with_info(|info| {
            info.pointer("/product_data/model_id")
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
    }

    pub fn as_four_button_switch(&self) -> Option<FourButtonSwitch> {
        FourButtonSwitch::from_resource(Arc::clone(self.resource()))
    }
}

impl FourButtonSwitch {
    pub fn as_device(&self) -> Device {
        Device(Arc::clone(&self.0))
    }

    /// The button service whose `metadata.control_id` equals `control_id`.
    pub async fn find_control(&self, control_id: u64) -> Result<Option<Button>, CoreError> {
        let store = self.store()?;
        let position = SwitchPosition::from_control_id(control_id);

        if let Some(id) = position.and_then(|p| self.control_links[p.index()].get()) {
            if let Some(button) = store.get(id).and_then(Button::from_resource) {
                return Ok(Some(button));
            }
        }

        for service in self.references("services") {
            if service.rtype != "button" {
                continue;
            }
            let Some(button) = Button::from_resource(store.resolve(&service).await?) else {
                continue;
            };
            if button.control_id() == Some(control_id) {
                if let Some(position) = position {
                    // a concurrent lookup may have set it already; same id either way
                    let _ = self.control_links[position.index()].set(button.id().to_owned());
                }
                return Ok(Some(button));
            }
        }
        Ok(None)
    }

    pub async fn control(&self, position: SwitchPosition) -> Result<Option<Button>, CoreError> {
        self.find_control(position.control_id()).await
    }

    pub async fn upper_left(&self) -> Result<Option<Button>, CoreError> {
        self.control(SwitchPosition::UpperLeft).await
    }

    pub async fn lower_left(&self) -> Result<Option<Button>, CoreError> {
        self.control(SwitchPosition::LowerLeft).await
    }

    pub async fn lower_right(&self) -> Result<Option<Button>, CoreError> {
        self.control(SwitchPosition::LowerRight).await
    }

    pub async fn upper_right(&self) -> Result<Option<Button>, CoreError> {
        self.control(SwitchPosition::UpperRight).await
    }
}

// ── Buttons ──────────────────────────────────────────────────────────

impl Button {
    /// `metadata.control_id`.
    pub fn control_id(&self) -> Option<u64> {
        self.with_info(|info| info.pointer("/metadata/control_id").and_then(Value::as_u64))
    }

    /// The most recent raw event in the cached state.
    pub fn last_event(&self) -> Option<ButtonEvent> {
        self.with_info(ButtonEvent::from_payload)
    }

    pub fn last_hold_duration(&self) -> Option<Duration> {
        self.last_hold()
    }

    /// Grouped lights that the bridge's v1 rules switch when this button's
    /// device reports an event.
    ///
    /// With `control_id`, only rules on that button's event value
    /// (`0x14 | control_id`) count. Groups are matched to cached grouped
    /// lights by `id_v1`.
    pub async fn grouped_lights(
        &self,
        control_id: Option<u64>,
    ) -> Result<Vec<GroupedLight>, CoreError> {
        let Some(sensor) = self.owner().await?.and_then(|owner| owner.id_v1()) else {
            return Ok(Vec::new());
        };
        let store = self.store()?;
        let rules = store.client().rules_v1().await?;
        let groups = rule_groups(&rules, &sensor, control_id);

        Ok(resolve_as(
            store.find_where(&Query::of_type("grouped_light"), |group| {
                group.id_v1().is_some_and(|id| groups.contains(&id))
            }),
            GroupedLight::from_resource,
        ))
    }

    /// Wait until the button is released and return the hold duration.
    ///
    /// Returns immediately when the button is not pressed.
    pub async fn wait_for_release(&self) -> Option<Duration> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let handle = self.watch(move |update| {
            if update.detail().button().is_some_and(|b| !b.pressed) {
                if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    let _ = tx.send(update.hold());
                }
            }
        });

        let hold = if self.is_pressed() {
            rx.await.ok().flatten()
        } else {
            self.last_hold()
        };
        handle.cancel();
        hold
    }
}

/// v1 group paths (`/groups/<n>`) acted on by rules triggered from
/// `sensor`'s button events.
fn rule_groups(rules: &Value, sensor: &str, control_id: Option<u64>) -> BTreeSet<String> {
    let Some(rules) = rules.as_object() else {
        return BTreeSet::new();
    };
    let address = format!("{sensor}/state/buttonevent");

    rules
        .values()
        .filter(|rule| {
            rule.get("conditions")
                .and_then(Value::as_array)
                .is_some_and(|conditions| {
                    conditions
                        .iter()
                        .any(|condition| triggered_by(condition, &address, control_id))
                })
        })
        .flat_map(|rule| rule.get("actions").and_then(Value::as_array).into_iter().flatten())
        .filter_map(|action| action.get("address").and_then(Value::as_str))
        .filter_map(group_path)
        .collect()
}

fn triggered_by(condition: &Value, address: &str, control_id: Option<u64>) -> bool {
    if condition.get("address").and_then(Value::as_str) != Some(address)
        || condition.get("operator").and_then(Value::as_str) != Some("eq")
    {
        return false;
    }
    let Some(control_id) = control_id else {
        return true;
    };
    // v1 rule values are strings
    let value = condition.get("value").and_then(|v| match v {
        Value::String(s) => s.parse::<u64>().ok(),
        other => other.as_u64(),
    });
    value == Some(0x14 | control_id)
}

/// `/groups/3/action` → `/groups/3`.
fn group_path(address: &str) -> Option<String> {
    let (id, _) = address.strip_prefix("/groups/")?.split_once('/')?;
    (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())).then(|| format!("/groups/{id}"))
}

// ── Connectivity ─────────────────────────────────────────────────────

impl ZigbeeConnectivity {
    pub fn mac_address(&self) -> Option<String> {
        self.with_info(|info| info.get("mac_address").and_then(Value::as_str).map(str::to_owned))
    }

    /// `connected`, `disconnected`, `connectivity_issue`, ...
    pub fn status(&self) -> Option<String> {
        self.with_info(|info| info.get("status").and_then(Value::as_str).map(str::to_owned))
    }
}
