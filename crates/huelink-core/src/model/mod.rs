// ── Domain model ──
//
// The cached resource, its kind table, references between resources,
// button telemetry, and the typed views built on top.

pub mod button;
pub mod kind;
pub mod reference;
pub mod resource;
pub mod views;

pub use button::{ButtonEvent, ButtonUpdate, PressState, SwitchPosition};
pub use kind::{FOUR_BUTTON_SWITCH_MODEL, KindRegistry, ResourceKind};
pub use reference::Reference;
pub use resource::Resource;
pub use views::{
    Button, CommandOptions, Device, FourButtonSwitch, GroupedLight, Light, RecallOptions, Room,
    Scene, ZigbeeConnectivity, Zone,
};
