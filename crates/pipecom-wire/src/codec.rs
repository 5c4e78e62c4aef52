use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::Result;

/// Acknowledgment marker sent back by a listener after each message.
///
/// Travels through [`encode`]/[`decode`] like any payload; receivers must
/// decode before comparing against it.
pub const ACK: &[u8] = b"ACK";

/// Default shutdown token recognized by listeners.
pub const DEFAULT_DIE_CODE: &str = "PIPECOM_DIE";

/// Encode a payload into its line-oriented wire form.
///
/// The output is standard base64 followed by a single `\n` terminator.
/// Base64 output never contains newlines or NUL bytes, so the encoded
/// form is safe to push through line-buffered FIFOs and message-mode
/// pipes alike.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = STANDARD.encode(payload).into_bytes();
    out.push(b'\n');
    out
}

/// Decode one wire line back into the original payload bytes.
///
/// Leading and trailing ASCII whitespace (including the line terminator)
/// is ignored. Malformed input fails with [`crate::WireError::Decode`]
/// rather than yielding partial data.
pub fn decode(line: &[u8]) -> Result<Vec<u8>> {
    let trimmed = trim_ascii(line);
    Ok(STANDARD.decode(trimmed)?)
}

/// Compare two decoded payloads without early exit on the first mismatch.
///
/// Used for die-code and ack-marker detection. Not a cryptographic
/// guarantee (the length check short-circuits), just enough to keep the
/// comparison honest for control-token purposes.
pub fn token_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Split a raw connection buffer into individual wire lines.
///
/// Multiple writers can interleave whole lines on a shared FIFO within one
/// connection window; each line is one message. Blank lines are dropped.
pub fn split(raw: &[u8]) -> Vec<&[u8]> {
    raw.split(|&b| b == b'\n')
        .map(trim_ascii)
        .filter(|line| !line.is_empty())
        .collect()
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
