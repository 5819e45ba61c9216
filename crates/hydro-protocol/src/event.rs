//! Events emitted by the controller to its consumers.
//!
//! Each event is also appended to the durable event log under the
//! category returned by [`FeedingEvent::category`].

use chrono::{DateTime, Utc};
use hydro_core::NodeAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a feedback message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackStatus {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for FeedbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Success => write!(f, "success"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedingEvent {
    /// Sequence started or ended.
    FeedingSequenceState { active: bool },

    /// Human-readable progress message.
    FeedingFeedback {
        message: String,
        status: FeedbackStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plant_ip: Option<NodeAddress>,
        timestamp: DateTime<Utc>,
    },

    /// A node's full sensor fired during fill.
    FillComplete { plant_ip: NodeAddress },
}

impl FeedingEvent {
    pub fn feedback(
        message: impl Into<String>,
        status: FeedbackStatus,
        plant_ip: Option<NodeAddress>,
    ) -> Self {
        Self::FeedingFeedback {
            message: message.into(),
            status,
            plant_ip,
            timestamp: Utc::now(),
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FeedingSequenceState { .. } => "feeding_sequence_state",
            Self::FeedingFeedback { .. } => "feeding_feedback",
            Self::FillComplete { .. } => "fill_complete",
        }
    }

    /// Event log category.
    pub fn category(&self) -> &'static str {
        "feeding"
    }
}
