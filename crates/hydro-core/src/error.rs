//! Domain-specific error types following panic-free policy.

use crate::NodeAddress;
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// Node not present in the registry
    #[error("Node not found: {address}")]
    NodeNotFound { address: NodeAddress },

    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },

    /// Phase transition that would break the sequencer invariants
    #[error("Invalid phase transition: {reason}")]
    InvalidTransition { reason: String },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

impl DomainError {
    /// Builds an `InvalidFieldValue` from anything displayable.
    pub fn invalid(field: &str, value: impl std::fmt::Display, expected: &str) -> Self {
        Self::InvalidFieldValue {
            field: field.to_string(),
            value: value.to_string(),
            expected: expected.to_string(),
        }
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_display() {
        let err = DomainError::NodeNotFound {
            address: NodeAddress::new("10.0.0.5"),
        };
        assert_eq!(err.to_string(), "Node not found: 10.0.0.5");

        let err = DomainError::invalid("calibration_factor", -1.0, "> 0");
        assert_eq!(
            err.to_string(),
            "Invalid calibration_factor: -1 (expected > 0)"
        );
    }
}
