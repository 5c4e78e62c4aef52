/// Errors that can occur while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The input is not a valid encoded message (bad alphabet or padding).
    #[error("malformed wire message: {0}")]
    Decode(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, WireError>;
