//! Byte-safe wire encoding for pipecom messaging.
//!
//! Every message that crosses a pipe (user payloads, the acknowledgment
//! marker, the die code) travels as a base64 line. The encoded form is
//! free of newlines and NUL bytes, so it survives line- and
//! terminator-sensitive pipe primitives, and it round-trips arbitrary
//! bytes exactly.
//!
//! Control tokens are compared only *after* decoding, never against the
//! encoded form, so encoding artifacts can never produce a false match.

pub mod codec;
pub mod error;

pub use codec::{decode, encode, split, token_eq, ACK, DEFAULT_DIE_CODE};
pub use error::{Result, WireError};
