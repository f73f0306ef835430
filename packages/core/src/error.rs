//! Error taxonomy shared by the server and the wire protocol.

use thiserror::Error;

use crate::job::{JobId, JobStatus, WorkerId};

/// Stable error codes carried in `ERR:` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Validation,
    InvalidTransition,
    NotOwned,
    JobNotFound,
    QueueNotFound,
    QueueExists,
    AccessDenied,
    Store,
    Protocol,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Validation => "eValidation",
            ErrorCode::InvalidTransition => "eInvalidTransition",
            ErrorCode::NotOwned => "eNotOwned",
            ErrorCode::JobNotFound => "eJobNotFound",
            ErrorCode::QueueNotFound => "eUnknownQueue",
            ErrorCode::QueueExists => "eDuplicateName",
            ErrorCode::AccessDenied => "eAccessDenied",
            ErrorCode::Store => "eStoreError",
            ErrorCode::Protocol => "eProtocolSyntaxError",
            ErrorCode::Internal => "eInternalError",
        }
    }

    /// Parse a wire code; unknown codes map to [`ErrorCode::Internal`].
    pub fn parse(s: &str) -> Self {
        const CODES: [ErrorCode; 10] = [
            ErrorCode::Validation,
            ErrorCode::InvalidTransition,
            ErrorCode::NotOwned,
            ErrorCode::JobNotFound,
            ErrorCode::QueueNotFound,
            ErrorCode::QueueExists,
            ErrorCode::AccessDenied,
            ErrorCode::Store,
            ErrorCode::Protocol,
            ErrorCode::Internal,
        ];
        CODES
            .into_iter()
            .find(|code| code.as_str() == s)
            .unwrap_or(ErrorCode::Internal)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("invalid {field} '{value}': {reason}")]
    Validation {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("job {job_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {job_id} is not owned by {worker}")]
    NotOwned { job_id: JobId, worker: WorkerId },

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("queue already exists: {0}")]
    QueueExists(String),

    #[error("host {host} may not {action} in queue {queue}")]
    AccessDenied {
        queue: String,
        host: String,
        action: &'static str,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl QueueError {
    pub fn validation(field: &'static str, value: &str, reason: impl Into<String>) -> Self {
        QueueError::Validation {
            field,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            QueueError::Validation { .. } => ErrorCode::Validation,
            QueueError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            QueueError::NotOwned { .. } => ErrorCode::NotOwned,
            QueueError::JobNotFound(_) => ErrorCode::JobNotFound,
            QueueError::QueueNotFound(_) => ErrorCode::QueueNotFound,
            QueueError::QueueExists(_) => ErrorCode::QueueExists,
            QueueError::AccessDenied { .. } => ErrorCode::AccessDenied,
            QueueError::Store(_) => ErrorCode::Store,
        }
    }
}

/// Errors raised by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store serialization error: {0}")]
    Serialization(String),
}

/// Malformed commands, replies or notification datagrams.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("malformed reply: {0}")]
    MalformedReply(String),

    #[error("line longer than {max} bytes")]
    LineTooLong { max: usize },
}

impl ProtocolError {
    pub fn invalid(field: &'static str, value: impl Into<String>) -> Self {
        ProtocolError::InvalidField {
            field,
            value: value.into(),
        }
    }
}
