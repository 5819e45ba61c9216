//! Hydro Core - Shared domain types for the feeding controller
//!
//! This crate provides the domain types shared between the wire protocol
//! (hydro-protocol) and the runtime (hydrod).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod flow;
pub mod level;
pub mod node;
pub mod outcome;
pub mod phase;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use flow::{FlowRole, FlowTotals};
pub use level::ReservoirLevel;
pub use node::{
    NodeAddress, NodeSettings, NodeStatusPatch, PlantNode, RelayState, ValveInfo, ValveRef,
    ValveRelay, WaterLevelSensor,
};
pub use outcome::{DrainOutcome, DrainReason, FillOutcome, FillReason};
pub use phase::{FeedingPhase, SequencerState};
