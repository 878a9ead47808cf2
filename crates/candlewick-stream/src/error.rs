//! Stream multiplexer errors.

use thiserror::Error;

use crate::{ConnectionId, Method};

/// Errors raised by the stream multiplexer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// No response arrived within the request timeout.
    #[error("{method} request on connection {connection} timed out")]
    RequestTimeout {
        /// Connection the request was sent on.
        connection: ConnectionId,
        /// Request method.
        method: Method,
    },

    /// The server's subscription list disagrees with the requested change.
    #[error("connection {connection}: {reason}: {}", .channels.join(", "))]
    ClientError {
        /// Connection whose subscriptions disagree.
        connection: ConnectionId,
        /// What went wrong.
        reason: &'static str,
        /// Channels that were not applied.
        channels: Vec<String>,
    },

    /// The server answered with an error response.
    #[error("request failed ({code}): {msg}")]
    RequestFailed {
        /// Server error code.
        code: i64,
        /// Server error message.
        msg: String,
    },

    /// The connection is not connected.
    #[error("connection {0} is not ready")]
    NotReady(ConnectionId),

    /// Establishing the transport failed.
    #[error("failed to connect to {endpoint}: {message}")]
    Connect {
        /// Endpoint that was dialed.
        endpoint: String,
        /// Underlying error.
        message: String,
    },

    /// Reading from or writing to the transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection closed while a request was outstanding.
    #[error("connection {0} closed")]
    Closed(ConnectionId),
}

impl StreamError {
    /// Returns true if the error is a transient transport condition rather
    /// than a rejection by the server.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. }
                | Self::NotReady(_)
                | Self::Connect { .. }
                | Self::Transport(_)
                | Self::Closed(_)
        )
    }
}
