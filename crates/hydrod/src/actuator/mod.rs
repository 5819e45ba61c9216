//! Commands to node-side actuators.
//!
//! [`NodeActuator`] is the seam the monitors and the sequencer talk to; the
//! production implementation is [`HttpActuatorClient`], which routes every
//! call through a [`RetryingClient`].

use async_trait::async_trait;
use hydro_core::{NodeAddress, RelayState};
use thiserror::Error;

use crate::resolve::ResolveError;

mod http;
mod retry;

pub use http::HttpActuatorClient;
pub use retry::{CallOutcome, FailureKind, RetryPolicy, RetryingClient};

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("{operation} on {node} failed: {kind}")]
    Call {
        node: NodeAddress,
        operation: String,
        #[source]
        kind: FailureKind,
    },

    #[error("cannot reach {node}: {source}")]
    Unresolved {
        node: NodeAddress,
        #[source]
        source: ResolveError,
    },
}

/// Valve relay and feeding-status commands on a node.
#[async_trait]
pub trait NodeActuator: Send + Sync {
    /// Switches relay `valve_id` hosted on `node`.
    async fn set_valve(
        &self,
        node: &NodeAddress,
        valve_id: u32,
        on: bool,
    ) -> Result<(), ActuatorError>;

    /// Relay state as reported by the hosting node.
    async fn valve_status(
        &self,
        node: &NodeAddress,
        valve_id: u32,
    ) -> Result<RelayState, ActuatorError>;

    /// Tells the node whether a feeding run is working on it.
    async fn set_feeding_status(
        &self,
        node: &NodeAddress,
        in_progress: bool,
    ) -> Result<(), ActuatorError>;
}
