//! Parsing node status snapshots.
//!
//! Nodes run a variety of firmware revisions, so every field is optional and
//! valve ids are accepted as numbers or numeric strings.

use std::collections::BTreeMap;

use hydro_core::{
    NodeAddress, NodeSettings, NodeStatusPatch, RelayState, ValveInfo, ValveRelay,
    WaterLevelSensor,
};
use serde::Deserialize;
use serde_json::Value;

/// Raw status snapshot pushed by a node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawNodeStatus {
    #[serde(default)]
    pub water_level: Option<BTreeMap<String, RawSensor>>,
    #[serde(default)]
    pub valve_info: Option<RawValveInfo>,
    #[serde(default)]
    pub settings: Option<RawNodeSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSensor {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub triggered: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawValveInfo {
    #[serde(default)]
    pub fill_valve: Option<Value>,
    #[serde(default)]
    pub fill_valve_ip: Option<String>,
    #[serde(default)]
    pub fill_valve_label: Option<String>,
    #[serde(default)]
    pub drain_valve: Option<Value>,
    #[serde(default)]
    pub drain_valve_ip: Option<String>,
    #[serde(default)]
    pub drain_valve_label: Option<String>,
    #[serde(default)]
    pub valve_relays: Option<BTreeMap<String, RawRelay>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRelay {
    #[serde(default)]
    pub status: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawNodeSettings {
    #[serde(default)]
    pub system_volume: Option<Value>,
    #[serde(default)]
    pub allow_remote_feeding: Option<bool>,
    #[serde(default)]
    pub system_name: Option<String>,
}

/// Reads a relay id from `3`, `"3"` or `" 3 "`.
fn valve_id(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn relay_state(value: Option<&Value>) -> RelayState {
    match value {
        Some(Value::String(s)) => RelayState::parse(s),
        Some(Value::Bool(true)) => RelayState::On,
        Some(Value::Bool(false)) => RelayState::Off,
        Some(Value::Number(n)) => match n.as_u64() {
            Some(0) => RelayState::Off,
            Some(_) => RelayState::On,
            None => RelayState::Unknown,
        },
        _ => RelayState::Unknown,
    }
}

fn address(raw: &Option<String>) -> Option<NodeAddress> {
    raw.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(NodeAddress::new)
}

impl RawValveInfo {
    pub fn to_valve_info(&self) -> ValveInfo {
        ValveInfo {
            fill_valve: valve_id(self.fill_valve.as_ref()),
            fill_valve_ip: address(&self.fill_valve_ip),
            fill_valve_label: self.fill_valve_label.clone(),
            drain_valve: valve_id(self.drain_valve.as_ref()),
            drain_valve_ip: address(&self.drain_valve_ip),
            drain_valve_label: self.drain_valve_label.clone(),
            valve_relays: self
                .valve_relays
                .iter()
                .flatten()
                .map(|(label, relay)| {
                    (
                        label.clone(),
                        ValveRelay {
                            status: relay_state(relay.status.as_ref()),
                        },
                    )
                })
                .collect(),
        }
    }
}

impl RawNodeSettings {
    pub fn to_settings(&self) -> NodeSettings {
        let defaults = NodeSettings::default();
        NodeSettings {
            system_volume: number(self.system_volume.as_ref())
                .filter(|v| v.is_finite() && *v > 0.0)
                .unwrap_or(defaults.system_volume),
            allow_remote_feeding: self.allow_remote_feeding.unwrap_or(false),
            system_name: self.system_name.clone(),
        }
    }
}

impl RawNodeStatus {
    /// Parses one JSON snapshot.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Converts to a registry patch. Absent sections stay `None`.
    pub fn to_patch(&self) -> NodeStatusPatch {
        NodeStatusPatch {
            water_level: self.water_level.as_ref().map(|sensors| {
                sensors
                    .iter()
                    .map(|(key, s)| {
                        (
                            key.clone(),
                            WaterLevelSensor {
                                label: s.label.clone().unwrap_or_default(),
                                triggered: s.triggered.unwrap_or(false),
                            },
                        )
                    })
                    .collect()
            }),
            valve_info: self.valve_info.as_ref().map(RawValveInfo::to_valve_info),
            settings: self.settings.as_ref().map(RawNodeSettings::to_settings),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_snapshot() {
        let raw = RawNodeStatus::from_value(json!({
            "water_level": {
                "sensor1": {"label": "Full", "triggered": false},
                "sensor2": {"label": "Empty", "triggered": true}
            },
            "valve_info": {
                "fill_valve": "1",
                "fill_valve_ip": "10.0.0.7",
                "fill_valve_label": "Fill",
                "drain_valve": 2,
                "drain_valve_label": "Drain",
                "valve_relays": {
                    "Fill": {"status": "off"},
                    "Drain": {"status": "ON"}
                }
            },
            "settings": {"system_volume": "6.5", "allow_remote_feeding": true}
        }))
        .unwrap();

        let patch = raw.to_patch();
        let levels = patch.water_level.unwrap();
        assert!(levels["sensor2"].triggered);
        assert_eq!(levels["sensor1"].label, "Full");

        let valves = patch.valve_info.unwrap();
        assert_eq!(valves.fill_valve, Some(1));
        assert_eq!(valves.drain_valve, Some(2));
        assert_eq!(valves.fill_valve_ip, Some(NodeAddress::new("10.0.0.7")));
        assert_eq!(valves.drain_valve_ip, None);
        assert_eq!(valves.valve_relays["Drain"].status, RelayState::On);
        assert_eq!(valves.valve_relays["Fill"].status, RelayState::Off);

        let settings = patch.settings.unwrap();
        assert!((settings.system_volume - 6.5).abs() < f64::EPSILON);
        assert!(settings.allow_remote_feeding);
    }

    #[test]
    fn test_partial_snapshot_leaves_sections_empty() {
        let raw = RawNodeStatus::from_value(json!({
            "water_level": {"sensor1": {"triggered": true}}
        }))
        .unwrap();
        let patch = raw.to_patch();
        assert!(patch.valve_info.is_none());
        assert!(patch.settings.is_none());
        assert_eq!(patch.water_level.unwrap()["sensor1"].label, "");
    }

    #[test]
    fn test_bad_volume_falls_back_to_default() {
        let raw = RawNodeSettings {
            system_volume: Some(json!(-3)),
            allow_remote_feeding: None,
            system_name: None,
        };
        let settings = raw.to_settings();
        assert!((settings.system_volume - 5.5).abs() < f64::EPSILON);
        assert!(!settings.allow_remote_feeding);
    }

    #[test]
    fn test_numeric_relay_status() {
        assert_eq!(relay_state(Some(&json!(1))), RelayState::On);
        assert_eq!(relay_state(Some(&json!(0))), RelayState::Off);
        assert_eq!(relay_state(None), RelayState::Unknown);
    }
}
