use std::fmt;

use crate::error::{PipeError, Result};

/// Resolved channel identity.
///
/// One concrete type for everything that names a channel: `send` accepts
/// anything convertible into it, including a running
/// [`crate::Listener`] (which contributes its own identity at the call
/// boundary). On POSIX the identity maps to a filesystem path (relative
/// names resolve against the working directory) and on Windows to
/// `\\.\pipe\<identity>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reject identities the platform layer cannot represent.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(PipeError::InvalidPipe {
                identity: self.0.clone(),
                reason: "channel identity must not be empty".to_string(),
            });
        }
        if self.0.contains('\0') {
            return Err(PipeError::InvalidPipe {
                identity: self.0.clone(),
                reason: "channel identity must not contain NUL".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(identity: &str) -> Self {
        Self::new(identity)
    }
}

impl From<String> for ChannelId {
    fn from(identity: String) -> Self {
        Self::new(identity)
    }
}

impl From<&String> for ChannelId {
    fn from(identity: &String) -> Self {
        Self::new(identity.clone())
    }
}
