use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur in named-channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel identity is already owned by another reader.
    #[error("channel already owned: {path}")]
    Conflict { path: PathBuf },

    /// No reader was listening on the channel within the deadline.
    #[error("failed to connect to {path}: {source}")]
    ConnectionFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The channel exists but cannot accept this connection attempt right
    /// now. Distinct from [`ChannelError::ConnectionFailed`] so callers can
    /// decide whether retrying is useful.
    #[error("channel busy: {path}")]
    Busy { path: PathBuf },

    /// OS-level access control rejected the operation.
    #[error("permission denied for {path}: {source}")]
    PermissionDenied {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The deadline elapsed before the operation completed.
    #[error("timed out after {waited:?} waiting on {path}")]
    Timeout { path: PathBuf, waited: Duration },

    /// An I/O error occurred on the channel.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
