/// Error types for the shim client.
///
/// Every fallible operation of the crate returns a `ShimError`. Variants
/// carry enough context (endpoint, array name, rectangle or query text) for
/// a caller to report the failure or retry the whole operation.
use crate::model::Rectangle;
use thiserror::Error;

/// Result type alias using ShimError.
pub type ShimResult<T> = Result<T, ShimError>;

#[derive(Debug, Error)]
pub enum ShimError {
    /// Login was rejected. Never retried.
    #[error("Authentication rejected by {host}: {reason}")]
    Authentication { host: String, reason: String },

    /// A session token could not be opened or released.
    #[error("Session error: {0}")]
    Session(String),

    /// Network-level failure, after the retry budget was spent.
    #[error("Transport failure on {endpoint} after {attempts} attempt(s): {reason}")]
    Transport {
        endpoint: &'static str,
        attempts: u32,
        reason: String,
    },

    /// The requested operation is malformed or incomplete.
    #[error("Cannot build query: {0}")]
    QueryBuild(String),

    /// The array, or the metadata needed to use it, does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Streaming binary cells to or from the gateway failed.
    #[error("Transfer of {array} {rect} failed: {reason}")]
    Transfer {
        array: String,
        rect: Rectangle,
        reason: String,
    },

    /// The gateway executed the query and rejected it.
    #[error("Query rejected with status {status}: {message} (query: {query})")]
    Query {
        query: String,
        status: u16,
        message: String,
    },

    /// The gateway answered with something we could not interpret.
    #[error("Unexpected response from {endpoint}: {message}")]
    Protocol {
        endpoint: &'static str,
        message: String,
    },
}

impl ShimError {
    /// Wrap a failure that happened while moving `rect` of `array`.
    ///
    /// Transport failures become `Transfer` errors so the caller learns which
    /// rectangle to retry. Everything else already names its own context
    /// and is passed through.
    pub fn during_transfer(self, array: &str, rect: Rectangle) -> ShimError {
        match self {
            ShimError::Transport {
                endpoint,
                attempts,
                reason,
            } => ShimError::Transfer {
                array: array.to_string(),
                rect,
                reason: format!("{} failed after {} attempt(s): {}", endpoint, attempts, reason),
            },
            other => other,
        }
    }

    /// True for the errors the transport layer already retried.
    pub fn is_transport(&self) -> bool {
        matches!(self, ShimError::Transport { .. })
    }
}
