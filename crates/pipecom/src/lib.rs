//! Named-pipe inter-process messaging with one contract across platforms.
//!
//! A [`Listener`] owns a channel identity, accepts messages on a
//! background thread, hands each decoded payload to a callback, and
//! acknowledges it. [`send`] connects to a named listener, transmits a
//! payload, and waits for the acknowledgment with a bounded retry budget.
//! POSIX FIFOs and Windows named pipes behave identically behind the
//! `pipecom-channel` primitive.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let mut listener = pipecom::Listener::new("jobs", |payload| {
//!     println!("received: {}", String::from_utf8_lossy(payload));
//!     None
//! });
//! listener.listen()?;
//!
//! let delivered = pipecom::send("jobs", b"hello", Duration::from_secs(5), 3)?;
//! assert!(delivered);
//! # Ok::<(), pipecom::PipeError>(())
//! ```
//!
//! Shutdown is cooperative: a listener stops on its idle timeout, on its
//! message budget, or on receiving its die code
//! ([`DEFAULT_DIE_CODE`] unless overridden). There is deliberately no
//! forced-stop API; tearing a channel down mid-connection would leave the
//! identity half-owned.

pub mod error;
pub mod identity;
pub mod listener;
pub mod sender;

pub use error::{ErrorCode, PipeError, Result};
pub use identity::ChannelId;
pub use listener::{Listener, ListenerStatus};
pub use pipecom_wire::DEFAULT_DIE_CODE;
pub use sender::send;

/// Default I/O buffer size for channel reads.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
