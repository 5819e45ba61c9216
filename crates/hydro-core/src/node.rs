//! Plant node entities and value objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::trace;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Network address of a plant node as written in configuration.
///
/// Usually an IPv4 literal or an mDNS name such as `"tent-2.local"`.
/// Resolution to a routable address happens at the edge (see `hydrod::resolve`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for NodeAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Sensors and Valves
// ============================================================================

/// One water-level switch as reported by a node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WaterLevelSensor {
    /// Human label, e.g. "Full" or "Empty".
    #[serde(default)]
    pub label: String,
    /// Whether the float switch is currently triggered.
    #[serde(default)]
    pub triggered: bool,
}

/// Reported state of a valve relay on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    On,
    Off,
    #[default]
    #[serde(other)]
    Unknown,
}

impl RelayState {
    /// Parses the loose status strings nodes send ("on", "OFF", "1", ...).
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "on" | "1" | "true" | "open" => Self::On,
            "off" | "0" | "false" | "closed" => Self::Off,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn is_on(&self) -> bool {
        matches!(self, Self::On)
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Relay entry in `valve_info.valve_relays`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValveRelay {
    #[serde(default)]
    pub status: RelayState,
}

/// Valve wiring of a node: which relay drives fill/drain, and where it lives.
///
/// A valve may be hosted by a different controller than the node itself,
/// hence the separate `*_ip` fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValveInfo {
    #[serde(default)]
    pub fill_valve: Option<u32>,
    #[serde(default)]
    pub fill_valve_ip: Option<NodeAddress>,
    #[serde(default)]
    pub fill_valve_label: Option<String>,
    #[serde(default)]
    pub drain_valve: Option<u32>,
    #[serde(default)]
    pub drain_valve_ip: Option<NodeAddress>,
    #[serde(default)]
    pub drain_valve_label: Option<String>,
    #[serde(default)]
    pub valve_relays: BTreeMap<String, ValveRelay>,
}

/// A resolved reference to one valve relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValveRef {
    /// Relay id on the hosting controller.
    pub id: u32,
    /// Controller hosting the relay.
    pub address: NodeAddress,
    /// Label used as key in `valve_relays`.
    pub label: String,
}

impl fmt::Display for ValveRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (relay {} @ {})", self.label, self.id, self.address)
    }
}

// ============================================================================
// Node Settings
// ============================================================================

fn default_system_volume() -> f64 {
    5.5
}

/// Per-node settings pushed by the node itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Reservoir volume in the same unit the flow meters are calibrated in.
    #[serde(default = "default_system_volume")]
    pub system_volume: f64,
    /// Whether this controller may start feeding on the node.
    #[serde(default)]
    pub allow_remote_feeding: bool,
    #[serde(default)]
    pub system_name: Option<String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            system_volume: default_system_volume(),
            allow_remote_feeding: false,
            system_name: None,
        }
    }
}

// ============================================================================
// Plant Node
// ============================================================================

/// Partial update applied to a node on each inbound status push.
///
/// `None` fields leave the current value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeStatusPatch {
    pub water_level: Option<BTreeMap<String, WaterLevelSensor>>,
    pub valve_info: Option<ValveInfo>,
    pub settings: Option<NodeSettings>,
}

/// Live view of one plant node.
///
/// Cloned out of the registry as an immutable snapshot; never shared by
/// reference across tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantNode {
    pub address: NodeAddress,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub settings: NodeSettings,
    pub water_level: BTreeMap<String, WaterLevelSensor>,
    pub valve_info: ValveInfo,
}

/// Sensor keys used when no sensor carries a recognisable label.
const FALLBACK_FULL_KEY: &str = "sensor1";
const FALLBACK_EMPTY_KEY: &str = "sensor2";

impl PlantNode {
    /// Creates an offline node with default settings.
    pub fn new(address: impl Into<NodeAddress>) -> Self {
        Self {
            address: address.into(),
            online: false,
            last_seen: None,
            settings: NodeSettings::default(),
            water_level: BTreeMap::new(),
            valve_info: ValveInfo::default(),
        }
    }

    /// Applies a status push and refreshes `last_seen`.
    pub fn apply(&mut self, patch: NodeStatusPatch, now: DateTime<Utc>) {
        if let Some(water_level) = patch.water_level {
            self.water_level = water_level;
        }
        if let Some(valve_info) = patch.valve_info {
            self.valve_info = valve_info;
        }
        if let Some(settings) = patch.settings {
            self.settings = settings;
        }
        if !self.online {
            trace!(node = %self.address, "status push brought node online");
        }
        self.online = true;
        self.last_seen = Some(now);
    }

    /// Name to show in logs and feedback messages.
    pub fn display_name(&self) -> &str {
        self.settings
            .system_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(self.address.as_str())
    }

    /// The "full" level switch.
    pub fn full_sensor(&self) -> Option<&WaterLevelSensor> {
        self.sensor_by_label("full")
            .or_else(|| self.water_level.get(FALLBACK_FULL_KEY))
    }

    /// The "empty" level switch.
    pub fn empty_sensor(&self) -> Option<&WaterLevelSensor> {
        self.sensor_by_label("empty")
            .or_else(|| self.water_level.get(FALLBACK_EMPTY_KEY))
    }

    fn sensor_by_label(&self, wanted: &str) -> Option<&WaterLevelSensor> {
        self.water_level
            .values()
            .find(|s| s.label.trim().eq_ignore_ascii_case(wanted))
    }

    /// The fill valve, if the node reported one.
    pub fn fill_valve(&self) -> Option<ValveRef> {
        let info = &self.valve_info;
        info.fill_valve.map(|id| ValveRef {
            id,
            address: info
                .fill_valve_ip
                .clone()
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| self.address.clone()),
            label: info
                .fill_valve_label
                .clone()
                .unwrap_or_else(|| format!("valve{id}")),
        })
    }

    /// The drain valve, if the node reported one.
    pub fn drain_valve(&self) -> Option<ValveRef> {
        let info = &self.valve_info;
        info.drain_valve.map(|id| ValveRef {
            id,
            address: info
                .drain_valve_ip
                .clone()
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| self.address.clone()),
            label: info
                .drain_valve_label
                .clone()
                .unwrap_or_else(|| format!("valve{id}")),
        })
    }

    /// Last reported relay state for a valve label.
    pub fn relay_state(&self, label: &str) -> RelayState {
        self.valve_info
            .valve_relays
            .get(label)
            .map(|r| r.status)
            .unwrap_or_default()
    }
}
