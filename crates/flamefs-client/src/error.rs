//! Client error types.

use flamefs_types::Status;

/// Errors surfaced at the client's public edge.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A service returned a non-OK status.
    #[error("status error: {0}")]
    Status(#[from] Status),

    /// Retry budget exhausted; carries the last classified error.
    #[error("retry exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Status },

    /// No routing entry covers the requested chain or target.
    #[error("routing incomplete: {0}")]
    RoutingIncomplete(String),

    /// Routing info went backwards; refresh and retry.
    #[error("stale routing: {0}")]
    StaleRouting(String),

    /// No connection handle for the destination node.
    #[error("no connection to node {0}")]
    NoConnection(flamefs_types::NodeId),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// An internal / unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for ClientError {
    fn from(err: anyhow::Error) -> Self {
        ClientError::Internal(err.to_string())
    }
}

impl ClientError {
    /// The underlying status code, when one exists.
    pub fn status_code(&self) -> Option<flamefs_types::status_code_t> {
        match self {
            ClientError::Status(status) => Some(status.code()),
            ClientError::RetryExhausted { last, .. } => Some(last.code()),
            _ => None,
        }
    }
}

/// Convenience result type.
pub type ClientResult<T> = std::result::Result<T, ClientError>;
