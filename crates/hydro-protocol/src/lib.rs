//! Hydro Protocol - Wire types for node communication
//!
//! This crate provides the message types exchanged with plant nodes over
//! their status streams and actuator HTTP API, plus the feeding events this
//! controller emits to its own consumers.

pub mod actuator;
pub mod error;
pub mod event;
pub mod message;
pub mod parse;

pub use actuator::{ActuatorReply, FeedingStatusRequest, ReplyStatus};
pub use error::ProtocolError;
pub use event::{FeedbackStatus, FeedingEvent};
pub use message::{NodeCommand, NodeMessage};
pub use parse::{RawNodeSettings, RawNodeStatus, RawSensor, RawValveInfo};
