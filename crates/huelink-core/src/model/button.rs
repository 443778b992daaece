// ── Button telemetry ──
//
// Buttons report raw events (`initial_press`, `short_release`, ...). The
// press state kept on the resource turns those into a pressed flag, a hold
// duration, and a long-press verdict.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};

/// Raw event reported by a button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ButtonEvent {
    InitialPress,
    Repeat,
    LongPress,
    ShortRelease,
    LongRelease,
    DoubleShortRelease,
}

impl ButtonEvent {
    pub fn is_press(self) -> bool {
        matches!(self, Self::InitialPress | Self::Repeat | Self::LongPress)
    }

    pub fn is_release(self) -> bool {
        !self.is_press()
    }

    /// Event carried by a button payload: `button.button_report.event`,
    /// falling back to `button.last_event`.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        payload
            .pointer("/button/button_report/event")
            .or_else(|| payload.pointer("/button/last_event"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// Event newly reported in `new` relative to `old`.
    ///
    /// `None` when `button_report` and `last_event` are unchanged, so a
    /// full snapshot carrying the previous report is not read as a new event.
    pub fn reported_change(old: &Value, new: &Value) -> Option<Self> {
        let report = |v: &Value| {
            (
                v.pointer("/button/button_report").cloned(),
                v.pointer("/button/last_event").cloned(),
            )
        };
        if report(old) == report(new) {
            return None;
        }
        Self::from_payload(new)
    }
}

/// Labeled position on the four-button wall switch, by `metadata.control_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SwitchPosition {
    UpperLeft,
    LowerLeft,
    LowerRight,
    UpperRight,
}

impl SwitchPosition {
    pub const ALL: [Self; 4] = [
        Self::UpperLeft,
        Self::LowerLeft,
        Self::LowerRight,
        Self::UpperRight,
    ];

    pub fn from_control_id(control_id: u64) -> Option<Self> {
        match control_id {
            0 => Some(Self::UpperLeft),
            1 => Some(Self::LowerLeft),
            2 => Some(Self::LowerRight),
            3 => Some(Self::UpperRight),
            _ => None,
        }
    }

    pub fn control_id(self) -> u64 {
        match self {
            Self::UpperLeft => 0,
            Self::LowerLeft => 1,
            Self::LowerRight => 2,
            Self::UpperRight => 3,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::UpperLeft => 0,
            Self::LowerLeft => 1,
            Self::LowerRight => 2,
            Self::UpperRight => 3,
        }
    }
}

/// What one button update means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonUpdate {
    pub event: ButtonEvent,
    /// Pressed after this update was applied.
    pub pressed: bool,
    /// Time held, set on releases.
    pub hold: Option<Duration>,
    pub long_press: bool,
}

/// Press bookkeeping stored on a button resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PressState {
    pressed_at: Option<DateTime<Utc>>,
    last_hold: Option<Duration>,
}

impl PressState {
    pub fn is_pressed(&self) -> bool {
        self.pressed_at.is_some()
    }

    pub fn pressed_at(&self) -> Option<DateTime<Utc>> {
        self.pressed_at
    }

    pub fn last_hold(&self) -> Option<Duration> {
        self.last_hold
    }

    /// Fold one event received at `at` into the state.
    ///
    /// Presses while already pressed keep the original start. A release
    /// with no observed press reports `long_press_threshold` as its hold.
    pub fn observe(
        &mut self,
        event: ButtonEvent,
        at: DateTime<Utc>,
        long_press_threshold: Duration,
    ) -> ButtonUpdate {
        if event.is_press() {
            self.pressed_at.get_or_insert(at);
            return ButtonUpdate {
                event,
                pressed: true,
                hold: None,
                long_press: false,
            };
        }

        let hold = self.pressed_at.take().map_or(long_press_threshold, |start| {
            (at - start).to_std().unwrap_or_default()
        });
        self.last_hold = Some(hold);

        ButtonUpdate {
            event,
            pressed: false,
            hold: Some(hold),
            long_press: hold > long_press_threshold,
        }
    }
}
