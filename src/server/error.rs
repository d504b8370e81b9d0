//! Error types for the query server transport.

use thiserror::Error;

/// Errors that can occur while talking to the query server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The request was cancelled by the caller, or the server acknowledged a
    /// `$/cancelRequest` for it.
    #[error("request cancelled")]
    Cancelled,

    /// The server process went away while the request was in flight.
    #[error("query server restarted before {method} completed")]
    ServerRestarted { method: String },

    /// No live connection to a server.
    #[error("query server is not running")]
    NotRunning,

    /// The caller's deadline passed before the server answered.
    #[error("{method} did not complete before its deadline")]
    Timeout { method: String },

    /// The server answered with a JSON-RPC error object.
    #[error("{method} failed with code {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    /// Malformed frame or message.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The server binary could not be launched.
    #[error("failed to spawn query server: {0}")]
    Spawn(String),
}

impl ServerError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub(crate) fn restarted(method: impl Into<String>) -> Self {
        Self::ServerRestarted {
            method: method.into(),
        }
    }

    /// True when the error means "the caller asked for this to stop".
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// JSON-RPC error code, when the server supplied one.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether retrying against a fresh server process could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ServerRestarted { .. } | Self::NotRunning | Self::Timeout { .. }
        )
    }
}
