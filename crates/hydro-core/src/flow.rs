//! Flow meter roles and volume snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which pipe a flow meter is installed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowRole {
    /// Fresh water line into the mixing manifold.
    Fresh,
    /// Nutrient (feed) line driven by the feed pump.
    Feed,
    /// Drain line out of the node reservoir.
    Drain,
}

impl FlowRole {
    /// All roles in a stable order.
    pub const ALL: [FlowRole; 3] = [FlowRole::Fresh, FlowRole::Feed, FlowRole::Drain];

    /// Short lowercase name used in logs and event payloads.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Feed => "feed",
            Self::Drain => "drain",
        }
    }
}

impl fmt::Display for FlowRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative volumes of all three meters at one instant.
///
/// `None` means the meter has not produced a reading yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowTotals {
    pub fresh: Option<f64>,
    pub feed: Option<f64>,
    pub drain: Option<f64>,
}

impl fmt::Display for FlowTotals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn part(v: Option<f64>) -> String {
            v.map(|v| format!("{v:.2}")).unwrap_or_else(|| "n/a".to_string())
        }
        write!(
            f,
            "fresh {} / feed {} / drain {}",
            part(self.fresh),
            part(self.feed),
            part(self.drain)
        )
    }
}
