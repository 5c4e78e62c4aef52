use std::fmt;

use pipecom_channel::ChannelError;

/// Classification of every pipecom failure, mirrored in
/// [`PipeError::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Bad identity or configuration, or the identity is already owned.
    InvalidPipe,
    /// No reader present, or the write side could not connect.
    ConnectionFailed,
    /// OS-level access control rejected the operation.
    PermissionDenied,
    /// A deadline elapsed without completion.
    Timeout,
    /// Any unclassified failure, wrapped with its origin.
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::InvalidPipe => "INVALID_PIPE",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by listeners and senders.
///
/// Every variant carries the channel identity it concerns; retry-driven
/// variants also carry the attempt count.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// Bad identity/configuration, or the identity is already owned by
    /// another listener.
    #[error("invalid pipe '{identity}': {reason}")]
    InvalidPipe { identity: String, reason: String },

    /// No listener could be reached within the attempt budget.
    #[error("connection to '{identity}' failed after {attempts} attempt(s)")]
    ConnectionFailed {
        identity: String,
        attempts: u32,
        #[source]
        source: Option<std::io::Error>,
    },

    /// OS-level access control rejected the operation.
    #[error("permission denied for '{identity}': {source}")]
    PermissionDenied {
        identity: String,
        #[source]
        source: std::io::Error,
    },

    /// The deadline elapsed waiting for an acknowledgment. The message may
    /// have been processed without the acknowledgment reaching the sender.
    #[error(
        "timed out on '{identity}' after {attempts} attempt(s); \
         the message may have been processed without acknowledgment"
    )]
    Timeout { identity: String, attempts: u32 },

    /// Any unclassified failure.
    #[error("pipe failure on '{identity}': {detail}")]
    Unknown { identity: String, detail: String },
}

impl PipeError {
    /// The error taxonomy bucket this failure belongs to.
    pub fn code(&self) -> ErrorCode {
        match self {
            PipeError::InvalidPipe { .. } => ErrorCode::InvalidPipe,
            PipeError::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            PipeError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            PipeError::Timeout { .. } => ErrorCode::Timeout,
            PipeError::Unknown { .. } => ErrorCode::Unknown,
        }
    }

    /// The channel identity the failure concerns.
    pub fn identity(&self) -> &str {
        match self {
            PipeError::InvalidPipe { identity, .. }
            | PipeError::ConnectionFailed { identity, .. }
            | PipeError::PermissionDenied { identity, .. }
            | PipeError::Timeout { identity, .. }
            | PipeError::Unknown { identity, .. } => identity,
        }
    }
}

/// Classify a channel-layer failure for the identity it occurred on.
pub(crate) fn from_channel(identity: &str, attempts: u32, err: ChannelError) -> PipeError {
    match err {
        ChannelError::Conflict { .. } => PipeError::InvalidPipe {
            identity: identity.to_string(),
            reason: "channel identity already owned by another listener".to_string(),
        },
        ChannelError::ConnectionFailed { source, .. } => PipeError::ConnectionFailed {
            identity: identity.to_string(),
            attempts,
            source: Some(source),
        },
        ChannelError::Busy { .. } => PipeError::ConnectionFailed {
            identity: identity.to_string(),
            attempts,
            source: None,
        },
        ChannelError::PermissionDenied { source, .. } => PipeError::PermissionDenied {
            identity: identity.to_string(),
            source,
        },
        ChannelError::Timeout { .. } => PipeError::Timeout {
            identity: identity.to_string(),
            attempts,
        },
        ChannelError::Io(err) => PipeError::Unknown {
            identity: identity.to_string(),
            detail: err.to_string(),
        },
    }
}

pub type Result<T> = std::result::Result<T, PipeError>;
