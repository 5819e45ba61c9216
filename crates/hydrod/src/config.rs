//! Controller settings.
//!
//! Settings are read from a JSON document (normally `data/settings.json`).
//! Every field is optional; missing fields take the defaults below. This
//! module only reads settings, writing them back belongs to the API layer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hydro_core::{FlowRole, NodeAddress};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Default settings location relative to the working directory.
pub const DEFAULT_SETTINGS_PATH: &str = "data/settings.json";

/// Default pulses-per-unit for the YF-style sensors shipped with the rig.
pub const DEFAULT_CALIBRATION_FACTOR: f64 = 28.390575;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Converts a seconds value from the settings file into a `Duration`.
///
/// Negative or non-finite values become zero; `validate` reports them first.
pub fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

// ============================================================================
// Sections
// ============================================================================

/// Pulses per volume unit for each flow meter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationFactors {
    pub fresh: f64,
    pub feed: f64,
    pub drain: f64,
}

impl Default for CalibrationFactors {
    fn default() -> Self {
        Self {
            fresh: DEFAULT_CALIBRATION_FACTOR,
            feed: DEFAULT_CALIBRATION_FACTOR,
            drain: DEFAULT_CALIBRATION_FACTOR,
        }
    }
}

/// Local relay board ports for the mixing manifold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayPorts {
    pub feed_water: u8,
    pub fresh_water: u8,
}

impl Default for RelayPorts {
    fn default() -> Self {
        Self {
            feed_water: 1,
            fresh_water: 2,
        }
    }
}

/// Thresholds for the drain monitor. Rates in units/min, times in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainFlowSettings {
    /// Minimum rate expected once the drain valve has had time to open.
    pub activation_flow_rate: f64,
    /// Rate below which the drain is considered to have stalled.
    pub min_flow_rate: f64,
    /// Wait after opening the valve before the activation check.
    pub activation_delay: f64,
    /// How long flow must stay below `min_flow_rate` before giving up.
    pub min_flow_check_delay: f64,
    /// Absolute cap on a drain phase.
    pub max_drain_time: f64,
}

impl Default for DrainFlowSettings {
    fn default() -> Self {
        Self {
            activation_flow_rate: 0.1,
            min_flow_rate: 0.05,
            activation_delay: 10.0,
            min_flow_check_delay: 30.0,
            max_drain_time: 600.0,
        }
    }
}

impl DrainFlowSettings {
    pub fn activation_delay(&self) -> Duration {
        secs(self.activation_delay)
    }

    pub fn min_flow_check_delay(&self) -> Duration {
        secs(self.min_flow_check_delay)
    }

    pub fn max_drain_time(&self) -> Duration {
        secs(self.max_drain_time)
    }
}

/// How the nutrient pump is driven.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedPumpConfig {
    /// GPIO output pin (BCM numbering).
    Io { io_number: u32 },
    /// Shelly-compatible smart plug reachable over HTTP.
    Shelly { ip: String },
}

/// BCM input pins of the three flow meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowPins {
    pub fresh: u32,
    pub feed: u32,
    pub drain: u32,
}

impl Default for FlowPins {
    fn default() -> Self {
        Self {
            fresh: 18,
            feed: 23,
            drain: 24,
        }
    }
}

impl FlowPins {
    pub fn pin_for(&self, role: FlowRole) -> u32 {
        match role {
            FlowRole::Fresh => self.fresh,
            FlowRole::Feed => self.feed,
            FlowRole::Drain => self.drain,
        }
    }
}

/// Ports and path prefix of the node-side services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodePorts {
    pub api: u16,
    pub status: u16,
    pub api_prefix: String,
}

impl Default for NodePorts {
    fn default() -> Self {
        Self {
            api: 8000,
            status: 8001,
            api_prefix: "/api".to_string(),
        }
    }
}

/// Phase timing knobs. The canonical defaults live here and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub valve_off_confirm_timeout_secs: f64,
    pub sensor_wait_attempts: u32,
    pub sensor_wait_timeout_secs: f64,
    pub sensor_wait_backoff_secs: f64,
    pub empty_sensor_grace_secs: f64,
    pub monitor_poll_ms: u64,
    pub mixing_poll_ms: u64,
    pub stop_grace_secs: f64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            valve_off_confirm_timeout_secs: 10.0,
            sensor_wait_attempts: 3,
            sensor_wait_timeout_secs: 900.0,
            sensor_wait_backoff_secs: 5.0,
            empty_sensor_grace_secs: 10.0,
            monitor_poll_ms: 1000,
            mixing_poll_ms: 100,
            stop_grace_secs: 3.0,
        }
    }
}

impl TimingSettings {
    pub fn valve_off_confirm_timeout(&self) -> Duration {
        secs(self.valve_off_confirm_timeout_secs)
    }

    pub fn sensor_wait_timeout(&self) -> Duration {
        secs(self.sensor_wait_timeout_secs)
    }

    pub fn sensor_wait_backoff(&self) -> Duration {
        secs(self.sensor_wait_backoff_secs)
    }

    pub fn empty_sensor_grace(&self) -> Duration {
        secs(self.empty_sensor_grace_secs)
    }

    pub fn monitor_poll(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_ms.max(1))
    }

    pub fn mixing_poll(&self) -> Duration {
        Duration::from_millis(self.mixing_poll_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        secs(self.stop_grace_secs)
    }
}

/// Retry policy for node HTTP calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub timeout_ms: u64,
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_ms: 5000,
            backoff_ms: 500,
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Controller settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Nodes to feed, in order.
    pub additional_plants: Vec<NodeAddress>,
    /// Name of this controller; `<name>.local` resolves to the local host.
    pub system_name: String,
    pub calibration_factors: CalibrationFactors,
    pub relay_ports: RelayPorts,
    /// GPIO output pin for each relay port on the local board.
    pub relay_pins: BTreeMap<u8, u32>,
    pub drain_flow_settings: DrainFlowSettings,
    /// Fresh:feed ratio, `ratio:1`.
    pub nutrient_concentration: f64,
    /// Whether nutrient mixing runs during fill.
    pub use_feed: bool,
    pub feed_pump: Option<FeedPumpConfig>,
    pub flow_pins: FlowPins,
    /// Nutrient reservoir float switch (active low).
    pub feed_level_pin: u32,
    pub node_ports: NodePorts,
    pub timing: TimingSettings,
    pub retry: RetrySettings,
    /// Directory for the JSONL event log.
    pub event_log_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            additional_plants: Vec::new(),
            system_name: "Garden".to_string(),
            calibration_factors: CalibrationFactors::default(),
            relay_ports: RelayPorts::default(),
            relay_pins: BTreeMap::from([(1, 5), (2, 6)]),
            drain_flow_settings: DrainFlowSettings::default(),
            nutrient_concentration: 1.0,
            use_feed: true,
            feed_pump: None,
            flow_pins: FlowPins::default(),
            feed_level_pin: 4,
            node_ports: NodePorts::default(),
            timing: TimingSettings::default(),
            retry: RetrySettings::default(),
            event_log_dir: None,
        }
    }
}

impl Settings {
    /// Loads and validates settings from `path`.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Unreadable file, malformed JSON, or a value `validate` rejects.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Settings file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let settings = Self::from_json(&raw)?;
        debug!(
            path = %path.display(),
            plants = settings.additional_plants.len(),
            "Settings loaded"
        );
        Ok(settings)
    }

    /// Parses and validates a settings document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cal = &self.calibration_factors;
        for (field, value) in [
            ("calibration_factors.fresh", cal.fresh),
            ("calibration_factors.feed", cal.feed),
            ("calibration_factors.drain", cal.drain),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(field, format!("{value} must be > 0")));
            }
        }

        let drain = &self.drain_flow_settings;
        for (field, value) in [
            ("drain_flow_settings.activation_flow_rate", drain.activation_flow_rate),
            ("drain_flow_settings.min_flow_rate", drain.min_flow_rate),
            ("drain_flow_settings.activation_delay", drain.activation_delay),
            ("drain_flow_settings.min_flow_check_delay", drain.min_flow_check_delay),
            ("drain_flow_settings.max_drain_time", drain.max_drain_time),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, format!("{value} must be >= 0")));
            }
        }
        if drain.min_flow_rate > drain.activation_flow_rate {
            return Err(invalid(
                "drain_flow_settings.min_flow_rate",
                format!(
                    "{} exceeds activation_flow_rate {}",
                    drain.min_flow_rate, drain.activation_flow_rate
                ),
            ));
        }

        if !self.nutrient_concentration.is_finite() || self.nutrient_concentration < 0.0 {
            return Err(invalid(
                "nutrient_concentration",
                format!("{} must be >= 0", self.nutrient_concentration),
            ));
        }

        let timing = &self.timing;
        for (field, value) in [
            ("timing.valve_off_confirm_timeout_secs", timing.valve_off_confirm_timeout_secs),
            ("timing.sensor_wait_timeout_secs", timing.sensor_wait_timeout_secs),
            ("timing.sensor_wait_backoff_secs", timing.sensor_wait_backoff_secs),
            ("timing.empty_sensor_grace_secs", timing.empty_sensor_grace_secs),
            ("timing.stop_grace_secs", timing.stop_grace_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, format!("{value} must be >= 0")));
            }
        }
        if timing.sensor_wait_attempts == 0 {
            return Err(invalid("timing.sensor_wait_attempts", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.relay_ports.feed_water == self.relay_ports.fresh_water {
            return Err(invalid(
                "relay_ports",
                "feed_water and fresh_water share a port",
            ));
        }
        Ok(())
    }

    /// Where feeding events are appended.
    pub fn event_log_dir(&self) -> PathBuf {
        self.event_log_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("data"))
                .join("hydrofeed")
                .join("logs")
        })
    }
}
