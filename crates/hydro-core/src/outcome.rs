//! Drain and fill phase outcomes.
//!
//! Monitors produce exactly one outcome per node and phase; the sequencer
//! consumes it once.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a drain phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainReason {
    ValveOnFailed,
    SensorTriggered,
    NoFlow,
    NoActivationFlow,
    Timeout,
    LowFlow,
    Interrupted,
}

impl DrainReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValveOnFailed => "valve_on_failed",
            Self::SensorTriggered => "sensor_triggered",
            Self::NoFlow => "no_flow",
            Self::NoActivationFlow => "no_activation_flow",
            Self::Timeout => "timeout",
            Self::LowFlow => "low_flow",
            Self::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for DrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one drain phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainOutcome {
    pub success: bool,
    pub reason: DrainReason,
}

impl DrainOutcome {
    pub fn completed(reason: DrainReason) -> Self {
        Self {
            success: true,
            reason,
        }
    }

    pub fn failed(reason: DrainReason) -> Self {
        Self {
            success: false,
            reason,
        }
    }

    /// Completed on a heuristic rather than the sensor.
    #[must_use]
    pub fn is_fail_open(&self) -> bool {
        self.success
            && matches!(
                self.reason,
                DrainReason::Timeout | DrainReason::LowFlow | DrainReason::NoActivationFlow
            )
    }
}

/// Why a fill phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillReason {
    ValveOnFailed,
    SensorTriggered,
    SensorTimeout,
    Interrupted,
}

impl FillReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValveOnFailed => "valve_on_failed",
            Self::SensorTriggered => "sensor_triggered",
            Self::SensorTimeout => "sensor_timeout",
            Self::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for FillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one fill phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillOutcome {
    pub success: bool,
    pub reason: FillReason,
}

impl FillOutcome {
    pub fn completed(reason: FillReason) -> Self {
        Self {
            success: true,
            reason,
        }
    }

    pub fn failed(reason: FillReason) -> Self {
        Self {
            success: false,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_open_classification() {
        assert!(DrainOutcome::completed(DrainReason::Timeout).is_fail_open());
        assert!(DrainOutcome::completed(DrainReason::LowFlow).is_fail_open());
        assert!(!DrainOutcome::completed(DrainReason::SensorTriggered).is_fail_open());
        assert!(!DrainOutcome::failed(DrainReason::NoFlow).is_fail_open());
    }

    #[test]
    fn test_reason_serde_names() {
        let json = serde_json::to_string(&DrainOutcome::completed(DrainReason::LowFlow)).unwrap();
        assert_eq!(json, r#"{"success":true,"reason":"low_flow"}"#);
        assert_eq!(FillReason::SensorTimeout.to_string(), "sensor_timeout");
    }
}
