//! Actuator identities and the actions that can be sent to them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Pump,
    Fan,
    Cover,
}

impl Device {
    pub const ALL: [Device; 3] = [Device::Pump, Device::Fan, Device::Cover];

    /// Device type name used on the gateway wire (`device_type`, `type`).
    pub fn kind(self) -> &'static str {
        match self {
            Device::Pump => "pump",
            Device::Fan => "fan",
            Device::Cover => "cover",
        }
    }

    /// Gateway device id: one actuator per kind in the greenhouse.
    pub fn gateway_id(self) -> &'static str {
        match self {
            Device::Pump => "pump1",
            Device::Fan => "fan1",
            Device::Cover => "cover1",
        }
    }

    /// Map a gateway id (`fan1`) or bare kind (`fan`) back to a device.
    pub fn from_gateway_id(id: &str) -> Option<Device> {
        id.trim_end_matches(|c: char| c.is_ascii_digit()).parse().ok()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pump" => Ok(Device::Pump),
            "fan" => Ok(Device::Fan),
            "cover" => Ok(Device::Cover),
            other => Err(format!("unknown device '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Cover position
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoverPosition {
    #[serde(rename = "OPEN", alias = "open")]
    Open,
    #[serde(rename = "HALF", alias = "half", alias = "half-open")]
    Half,
    #[default]
    #[serde(rename = "CLOSED", alias = "closed")]
    Closed,
}

impl CoverPosition {
    pub fn as_str(self) -> &'static str {
        match self {
            CoverPosition::Open => "OPEN",
            CoverPosition::Half => "HALF",
            CoverPosition::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for CoverPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoverPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Ok(CoverPosition::Open),
            "HALF" | "HALF-OPEN" => Ok(CoverPosition::Half),
            "CLOSED" => Ok(CoverPosition::Closed),
            other => Err(format!("unknown cover position '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// A target state for one actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "device", rename_all = "lowercase")]
pub enum Action {
    Pump { on: bool },
    Fan { on: bool },
    Cover { position: CoverPosition },
}

impl Action {
    pub fn device(&self) -> Device {
        match self {
            Action::Pump { .. } => Device::Pump,
            Action::Fan { .. } => Device::Fan,
            Action::Cover { .. } => Device::Cover,
        }
    }

    /// The `status` value carried in a gateway control request.
    pub fn wire_status(&self) -> serde_json::Value {
        match self {
            Action::Pump { on } | Action::Fan { on } => serde_json::Value::Bool(*on),
            Action::Cover { position } => serde_json::Value::from(position.as_str()),
        }
    }

    /// The action that switches a pump or fan off. Covers have no "off".
    pub fn switch_off(device: Device) -> Option<Action> {
        match device {
            Device::Pump => Some(Action::Pump { on: false }),
            Device::Fan => Some(Action::Fan { on: false }),
            Device::Cover => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Pump { on } | Action::Fan { on } => {
                write!(f, "{}={}", self.device(), if *on { "ON" } else { "OFF" })
            }
            Action::Cover { position } => write!(f, "cover=SET_POSITION({position})"),
        }
    }
}

/// Operator-facing command body: `{"on": true}` or `{"position": "OPEN"}`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Switch { on: bool },
    Position { position: CoverPosition },
}

impl Command {
    /// Bind a command to a device, rejecting shapes the device cannot take.
    pub fn for_device(self, device: Device) -> Option<Action> {
        match (device, self) {
            (Device::Pump, Command::Switch { on }) => Some(Action::Pump { on }),
            (Device::Fan, Command::Switch { on }) => Some(Action::Fan { on }),
            (Device::Cover, Command::Position { position }) => Some(Action::Cover { position }),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Scheduler,
    Manual,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Source::Scheduler => "scheduler",
            Source::Manual => "manual",
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
