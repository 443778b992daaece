// ── Resource kinds ──
//
// The bridge's `type` discriminator picks a kind at construction time.
// Devices get a second lookup on `product_data.model_id` so specialized
// hardware can have its own kind without changing the device contract.

use std::collections::HashMap;

use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};

/// Typed role of a cached resource. Anything unrecognized is `Generic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    Light,
    GroupedLight,
    Scene,
    Device,
    /// A device whose model is the four-button wall switch.
    FourButtonSwitch,
    Room,
    Zone,
    Button,
    ZigbeeConnectivity,
    Generic,
}

impl ResourceKind {
    /// Whether resources of this kind satisfy the generic device contract.
    pub fn is_device(self) -> bool {
        matches!(self, Self::Device | Self::FourButtonSwitch)
    }
}

/// Model id reported by the four-button wall switch.
pub const FOUR_BUTTON_SWITCH_MODEL: &str = "FOHSWITCH";

/// Explicit discriminator → kind table, built once per store.
#[derive(Debug, Clone)]
pub struct KindRegistry {
    by_type: HashMap<String, ResourceKind>,
    by_device_model: HashMap<String, ResourceKind>,
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl KindRegistry {
    /// An empty registry: every resource is `Generic`.
    pub fn empty() -> Self {
        Self {
            by_type: HashMap::new(),
            by_device_model: HashMap::new(),
        }
    }

    /// The built-in table.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for kind in [
            ResourceKind::Light,
            ResourceKind::GroupedLight,
            ResourceKind::Scene,
            ResourceKind::Device,
            ResourceKind::Room,
            ResourceKind::Zone,
            ResourceKind::Button,
            ResourceKind::ZigbeeConnectivity,
        ] {
            registry.register_type(kind.as_ref(), kind);
        }
        registry.register_device_model(FOUR_BUTTON_SWITCH_MODEL, ResourceKind::FourButtonSwitch);
        registry
    }

    pub fn register_type(&mut self, rtype: impl Into<String>, kind: ResourceKind) -> &mut Self {
        self.by_type.insert(rtype.into(), kind);
        self
    }

    pub fn register_device_model(
        &mut self,
        model_id: impl Into<String>,
        kind: ResourceKind,
    ) -> &mut Self {
        self.by_device_model.insert(model_id.into(), kind);
        self
    }

    /// Pick the kind for a resource body.
    pub fn classify(&self, rtype: &str, info: &Value) -> ResourceKind {
        let kind = self
            .by_type
            .get(rtype)
            .copied()
            .unwrap_or(ResourceKind::Generic);

        if kind != ResourceKind::Device {
            return kind;
        }

        info.pointer("/product_data/model_id")
            .and_then(Value::as_str)
            .and_then(|model| self.by_device_model.get(model))
            .copied()
            .unwrap_or(kind)
    }
}
