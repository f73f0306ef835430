//! Client error types.

use netschedule_core::{ErrorCode, ProtocolError, QueueError};
use thiserror::Error;

/// Failure of one request to one server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The server could not be reached or the connection broke.
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// The server answered with an error reply.
    #[error("server error {code}: {message}")]
    Server { code: ErrorCode, message: String },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl RpcError {
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, RpcError::ConnectionFailure(_))
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// The wait was stopped through its control handle.
    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error(transparent)]
    Validation(#[from] QueueError),
}

impl ClientError {
    /// A well-formed reply of the wrong kind for the request.
    pub(crate) fn unexpected(reply: &netschedule_core::Reply) -> Self {
        ClientError::Rpc(RpcError::Protocol(ProtocolError::MalformedReply(format!(
            "unexpected reply {reply:?}"
        ))))
    }
}
