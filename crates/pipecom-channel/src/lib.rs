//! Platform named-channel primitive for pipecom.
//!
//! Exposes one capability set over two very different OS mechanisms:
//! - POSIX FIFOs (Linux/macOS), where a "connection" is one open/close of
//!   the write end and acknowledgments travel over a companion `_ack` FIFO
//! - Windows named pipes, where a connection is a duplex pipe instance
//!
//! The two roles:
//! - **Reader** ([`Endpoint`]): owns a channel identity, accepts one
//!   connection at a time, reads whole messages, writes replies back.
//! - **Writer** ([`Outbound`]): connects to a named endpoint, sends one
//!   message, reads the reply.
//!
//! Every blocking operation takes an explicit [`Deadline`]. Callers above
//! this crate never branch on platform identity; the adapter selected by
//! `cfg` satisfies identical pre/postconditions.

pub mod deadline;
pub mod error;

#[cfg(unix)]
mod alarm;
#[cfg(unix)]
pub mod fifo;

#[cfg(windows)]
pub mod winpipe;

pub use deadline::{Deadline, POLL_INTERVAL};
pub use error::{ChannelError, Result};

#[cfg(unix)]
pub use fifo::{Endpoint, Inbound, Outbound};

#[cfg(windows)]
pub use winpipe::{Endpoint, Inbound, Outbound};
