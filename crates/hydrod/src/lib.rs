//! hydrod - Runtime of the hydrofeed controller
//!
//! This crate drives the feeding cycle across the plant nodes:
//! - `registry` - Live node state, fed by one status link per node
//! - `flow` - Pulse flow meters for the fresh, feed and drain lines
//! - `actuator` - Retrying HTTP client for node valves and feeding status
//! - `hw` - Local GPIO relays, feed pump and reservoir switch
//! - `monitor` - Drain and fill phase monitors
//! - `mixing` - Nutrient mixing regulator
//! - `sequencer` - The feeding sequencer and global stop
//! - `events` - Event bus, JSONL event log and operator notifications
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        hydrofeedd                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────┐  status   ┌──────────────┐                 │
//! │  │  NodeLink    │──────────▶│ NodeRegistry │◀──── snapshots ─┐│
//! │  │ (per node)   │◀──────────│              │                 ││
//! │  └──────────────┘ commands  └──────────────┘                 ││
//! │                                                              ││
//! │  ┌──────────────────┐ phase  ┌─────────────────┐  ┌────────┐ ││
//! │  │ FeedingSequencer │───────▶│SequencerContext │◀─│ Mixing │ ││
//! │  └────────┬─────────┘        └─────────────────┘  │Regulator│ ││
//! │           │ spawns                                └───┬────┘ ││
//! │           ▼                                           │      ││
//! │  ┌──────────────────┐   valves   ┌──────────────┐     │ pump ││
//! │  │ Drain/FillMonitor│───────────▶│ NodeActuator │     │ relays│
//! │  └────────┬─────────┘            └──────────────┘     ▼      ││
//! │           │ rates                            ┌──────────────┐││
//! │           ▼                                  │ RelayBoard / │││
//! │  ┌──────────────────┐                        │  PumpDriver  │││
//! │  │    FlowMeters    │◀── sampler tasks       └──────────────┘││
//! │  └──────────────────┘                                        ┘│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Poisoned mutexes are recovered, channel closures handled
//! - Every valve a task opens is closed on every exit path of that task

pub mod actuator;
pub mod config;
pub mod context;
pub mod events;
pub mod flow;
pub mod hw;
pub mod mixing;
pub mod monitor;
pub mod registry;
pub mod resolve;
pub mod rig;
pub mod sequencer;
pub mod testing;

pub use config::Settings;
pub use context::SequencerContext;
pub use mixing::{MixingConfig, MixingRegulator};
pub use rig::Rig;
pub use sequencer::{FeedingSequencer, SequencerConfig, SequencerError};
