//! Per-node phase monitors.
//!
//! A monitor is a short-lived task that owns one valve for one phase of one
//! node. It opens the valve, decides when the phase is over, closes the
//! valve on every exit path and returns exactly one outcome. Cancellation of
//! the run token is observed at every sleep.

use std::sync::Arc;
use std::time::Duration;

use hydro_core::{NodeAddress, ValveRef};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::actuator::NodeActuator;
use crate::registry::NodeRegistry;

mod drain;
mod fill;

pub use drain::DrainMonitor;
pub use fill::FillMonitor;

/// Sleeps for `duration`. Returns `false` if `cancel` fired first.
pub(crate) async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Best-effort valve off. Failures are logged; the command is idempotent.
pub(crate) async fn switch_off(actuator: &Arc<dyn NodeActuator>, valve: &ValveRef) -> bool {
    match actuator.set_valve(&valve.address, valve.id, false).await {
        Ok(()) => {
            debug!(valve = %valve, "Valve closed");
            true
        }
        Err(e) => {
            warn!(valve = %valve, error = %e, "Failed to close valve");
            false
        }
    }
}

/// Which level switch to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Switch {
    Full,
    Empty,
}

/// Current reading of a node's level switch, if reported.
pub(crate) fn read_switch(
    registry: &NodeRegistry,
    node: &NodeAddress,
    switch: Switch,
) -> Option<bool> {
    let snapshot = registry.snapshot(node)?;
    let sensor = match switch {
        Switch::Full => snapshot.full_sensor(),
        Switch::Empty => snapshot.empty_sensor(),
    };
    sensor.map(|s| s.triggered)
}
