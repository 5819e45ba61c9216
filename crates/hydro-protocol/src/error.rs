//! Protocol errors.

use thiserror::Error;

/// Errors raised while decoding node traffic.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Line was not valid JSON for the expected message type.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Line exceeded the per-message size limit.
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}
