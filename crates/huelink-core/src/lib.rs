// huelink-core: Live resource mirror and background sync for one Hue bridge.

pub mod config;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod update;
pub mod watch;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{BridgeCredentials, HubConfig, TlsVerification};
pub use error::CoreError;
pub use hub::{EventKind, Hub, HubEvent};
pub use lifecycle::{Lifecycle, LifecycleToken};
pub use scheduler::{TaskFn, TaskFuture};
pub use store::{Query, ResourceStore, StoreSettings};
pub use update::{Batch, Update, UpdateClass, UpdateDetail, UpdateSource, gentle_merge};
pub use watch::{WatchHandle, WatcherList};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    // Resources and references
    KindRegistry, Reference, Resource, ResourceKind,
    // Typed views
    Button, CommandOptions, Device, FourButtonSwitch, GroupedLight, Light, RecallOptions, Room,
    Scene, ZigbeeConnectivity, Zone,
    // Button telemetry
    ButtonEvent, ButtonUpdate, PressState, SwitchPosition,
};

pub use huelink_api::{IgnoreErrors, RequestOptions};
