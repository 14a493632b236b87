//! Error types for the Shelter environment abstraction.

use thiserror::Error;

/// Errors that can occur talking to the simulation service.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Connection refused, DNS failure, reset, etc.
    #[error("Network error: {0}")]
    Network(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// The service answered with a non-success HTTP status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Response body could not be parsed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The service answered `success: false`
    #[error("Rejected by service: {0}")]
    Rejected(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    Context(String),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Creates a rejection error.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// True for failures worth retrying on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}
