//! Per-node results and human-readable run summaries.

use std::fmt;
use std::time::Duration;

use hydro_core::NodeAddress;
use serde::Serialize;

/// How one node's cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeResult {
    Completed,
    /// Not attempted (offline, not allowed, unresolvable, ...).
    Skipped(String),
    /// Attempted and abandoned.
    Failed(String),
    /// Interrupted by an operator or reservoir stop.
    Stopped,
}

/// Node bookkeeping for the current run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub completed: Vec<NodeAddress>,
    pub skipped: Vec<(NodeAddress, String)>,
    pub failed: Vec<(NodeAddress, String)>,
    pub stopped: Vec<NodeAddress>,
    pub remaining: Vec<NodeAddress>,
}

impl RunProgress {
    pub fn new(nodes: &[NodeAddress]) -> Self {
        Self {
            remaining: nodes.to_vec(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, node: &NodeAddress, result: &NodeResult) {
        self.remaining.retain(|n| n != node);
        match result {
            NodeResult::Completed => self.completed.push(node.clone()),
            NodeResult::Skipped(reason) => self.skipped.push((node.clone(), reason.clone())),
            NodeResult::Failed(reason) => self.failed.push((node.clone(), reason.clone())),
            NodeResult::Stopped => self.stopped.push(node.clone()),
        }
    }
}

fn list(nodes: &[NodeAddress]) -> String {
    if nodes.is_empty() {
        return "none".to_string();
    }
    nodes
        .iter()
        .map(NodeAddress::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn list_with_reasons(nodes: &[(NodeAddress, String)]) -> String {
    if nodes.is_empty() {
        return "none".to_string();
    }
    nodes
        .iter()
        .map(|(n, why)| format!("{n} ({why})"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEnd {
    Completed,
    Stopped,
    ReservoirEmpty,
}

/// Final report of a feeding run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub end: RunEnd,
    pub progress: RunProgress,
    pub elapsed: Duration,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headline = match self.end {
            RunEnd::Completed => "Feeding sequence completed",
            RunEnd::Stopped => "Feeding sequence stopped",
            RunEnd::ReservoirEmpty => "Feeding sequence halted: nutrient reservoir empty",
        };
        let p = &self.progress;
        write!(
            f,
            "{headline} after {}s. Completed: {}. Skipped: {}. Failed: {}.",
            self.elapsed.as_secs(),
            list(&p.completed),
            list_with_reasons(&p.skipped),
            list_with_reasons(&p.failed),
        )?;
        if !p.stopped.is_empty() || !p.remaining.is_empty() {
            write!(
                f,
                " Stopped: {}. Not started: {}.",
                list(&p.stopped),
                list(&p.remaining)
            )?;
        }
        Ok(())
    }
}

/// Report of a global stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopSummary {
    /// Whether a run was active when the stop arrived.
    pub was_active: bool,
    pub progress: RunProgress,
}

impl fmt::Display for StopSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.was_active {
            return write!(f, "No feeding sequence was running; all actuators switched off.");
        }
        let p = &self.progress;
        write!(
            f,
            "Feeding stopped. Completed: {}. Stopped: {}. Remaining: {}.",
            list(&p.completed),
            list(&p.stopped),
            list(&p.remaining)
        )
    }
}
