//! Nutrient reservoir level.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of the shared nutrient reservoir float switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservoirLevel {
    Empty,
    Full,
}

impl ReservoirLevel {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl fmt::Display for ReservoirLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Full => write!(f, "Full"),
        }
    }
}
