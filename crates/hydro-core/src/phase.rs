//! Sequencer phase and the shared run state.

use crate::{DomainError, DomainResult, NodeAddress};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of the feeding cycle currently being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedingPhase {
    #[default]
    Idle,
    Drain,
    Fill,
}

impl fmt::Display for FeedingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Drain => write!(f, "drain"),
            Self::Fill => write!(f, "fill"),
        }
    }
}

/// Global run state published by the sequencer.
///
/// Invariant: `phase != Idle` implies `active`. The transition methods
/// enforce it; fields are public for cheap snapshot reads only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerState {
    pub active: bool,
    pub phase: FeedingPhase,
    pub current_node: Option<NodeAddress>,
    pub stop_requested: bool,
}

impl SequencerState {
    /// Marks a fresh run as started.
    pub fn begin(&mut self) {
        self.active = true;
        self.phase = FeedingPhase::Idle;
        self.current_node = None;
        self.stop_requested = false;
    }

    /// Enters a phase for a node.
    ///
    /// # Errors
    ///
    /// Refuses when the run is not active or a stop has been requested.
    pub fn enter(&mut self, phase: FeedingPhase, node: &NodeAddress) -> DomainResult<()> {
        if phase == FeedingPhase::Idle {
            self.phase = FeedingPhase::Idle;
            self.current_node = None;
            return Ok(());
        }
        if !self.active {
            return Err(DomainError::InvalidTransition {
                reason: format!("cannot enter {phase} for {node}: sequence not active"),
            });
        }
        if self.stop_requested {
            return Err(DomainError::InvalidTransition {
                reason: format!("cannot enter {phase} for {node}: stop requested"),
            });
        }
        self.phase = phase;
        self.current_node = Some(node.clone());
        Ok(())
    }

    /// Returns to idle between nodes.
    pub fn idle(&mut self) {
        self.phase = FeedingPhase::Idle;
        self.current_node = None;
    }

    /// Forces the stopped state. Idempotent.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
        self.active = false;
        self.phase = FeedingPhase::Idle;
        self.current_node = None;
    }

    /// Marks the run as finished without a stop request.
    pub fn finish(&mut self) {
        self.active = false;
        self.phase = FeedingPhase::Idle;
        self.current_node = None;
    }

    /// Checks `phase != Idle ⇒ active`.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.phase == FeedingPhase::Idle || self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_requires_active() {
        let mut state = SequencerState::default();
        let node = NodeAddress::new("a");
        assert!(state.enter(FeedingPhase::Drain, &node).is_err());
        assert_eq!(state.phase, FeedingPhase::Idle);

        state.begin();
        state.enter(FeedingPhase::Drain, &node).unwrap();
        assert_eq!(state.phase, FeedingPhase::Drain);
        assert_eq!(state.current_node, Some(node));
        assert!(state.is_consistent());
    }

    #[test]
    fn test_stop_forces_idle() {
        let mut state = SequencerState::default();
        let node = NodeAddress::new("a");
        state.begin();
        state.enter(FeedingPhase::Fill, &node).unwrap();

        state.request_stop();
        assert!(!state.active);
        assert_eq!(state.phase, FeedingPhase::Idle);
        assert!(state.stop_requested);
        assert!(state.enter(FeedingPhase::Fill, &node).is_err());

        // Twice is fine.
        state.request_stop();
        assert!(state.is_consistent());
    }

    #[test]
    fn test_begin_clears_stop() {
        let mut state = SequencerState::default();
        state.request_stop();
        state.begin();
        assert!(state.active);
        assert!(!state.stop_requested);
    }
}
