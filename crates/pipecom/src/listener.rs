use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use pipecom_channel::{ChannelError, Deadline, Endpoint, Inbound};
use pipecom_wire as wire;
use tracing::{debug, info, warn};

use crate::error::{from_channel, PipeError, Result};
use crate::identity::ChannelId;
use crate::sender;
use crate::DEFAULT_BUFFER_SIZE;

/// Budget for delivering one acknowledgment back to a sender.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Best-effort budget for forwarding a callback result to the response
/// channel.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_MAX_ATTEMPTS: u32 = 3;

/// Message handler invoked for each decoded payload. A `Some` return value
/// is forwarded to the response channel when one is configured.
///
/// Callers needing shared state should pass it explicitly through their own
/// synchronized container; nothing is shared with the listener thread
/// beyond this function value.
pub type Callback = dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static;

/// Lifecycle of a [`Listener`]. Terminal states are final; a new instance
/// is required to resume service under the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListenerStatus {
    /// Constructed, not yet listening.
    Idle = 0,
    /// Accept loop running on the background thread.
    Running = 1,
    /// Idle timeout elapsed with no connecting sender.
    StoppedTimeout = 2,
    /// The configured message budget was reached.
    StoppedMaxMessages = 3,
    /// The die code was received.
    StoppedDieCode = 4,
    /// The accept loop hit an unrecoverable channel error.
    StoppedError = 5,
}

impl ListenerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ListenerStatus::Running,
            2 => ListenerStatus::StoppedTimeout,
            3 => ListenerStatus::StoppedMaxMessages,
            4 => ListenerStatus::StoppedDieCode,
            5 => ListenerStatus::StoppedError,
            _ => ListenerStatus::Idle,
        }
    }

    /// Whether this is a final state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ListenerStatus::Idle | ListenerStatus::Running)
    }
}

/// Receives messages on a named channel and acknowledges each one.
///
/// Configuration is immutable once [`Listener::listen`] has been called.
/// The callback runs on the listener's own background thread, one
/// connection at a time; concurrency across senders queues at the OS
/// primitive.
pub struct Listener {
    identity: ChannelId,
    callback: Option<Box<Callback>>,
    timeout: Duration,
    max_messages: u64,
    die_code: Vec<u8>,
    daemon: bool,
    response_channel: Option<ChannelId>,
    buffer_size: usize,
    status: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    /// Create a listener for `identity` with default configuration:
    /// unbounded idle timeout, unbounded message count, the default die
    /// code, daemon thread, no response channel, 4 KiB buffer.
    pub fn new<F>(identity: impl Into<ChannelId>, callback: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        Self {
            identity: identity.into(),
            callback: Some(Box::new(callback)),
            timeout: Duration::ZERO,
            max_messages: 0,
            die_code: wire::DEFAULT_DIE_CODE.as_bytes().to_vec(),
            daemon: true,
            response_channel: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            status: Arc::new(AtomicU8::new(ListenerStatus::Idle as u8)),
            handle: None,
        }
    }

    /// Idle timeout before the accept loop gives up. Zero waits forever.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Stop after this many processed messages. Zero means unbounded.
    pub fn with_max_messages(mut self, max_messages: u64) -> Self {
        self.max_messages = max_messages;
        self
    }

    /// Override the shutdown token.
    ///
    /// A user payload that happens to equal the die code is
    /// indistinguishable from a shutdown request; pick a value that cannot
    /// collide with real traffic.
    pub fn with_die_code(mut self, die_code: impl Into<String>) -> Self {
        self.die_code = die_code.into().into_bytes();
        self
    }

    /// Whether the background thread is detached (`true`, the default) or
    /// joined when the listener is dropped.
    pub fn with_daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    /// Forward callback return values to this channel, best-effort.
    pub fn with_response_channel(mut self, response: impl Into<ChannelId>) -> Self {
        self.response_channel = Some(response.into());
        self
    }

    /// I/O buffer size for channel reads.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Start the accept loop on a background thread and return
    /// immediately.
    ///
    /// Fails synchronously with [`crate::ErrorCode::InvalidPipe`] when the
    /// channel cannot be created (identity conflict) or when this instance
    /// has already been started.
    pub fn listen(&mut self) -> Result<()> {
        if self.status() != ListenerStatus::Idle {
            return Err(PipeError::InvalidPipe {
                identity: self.identity.to_string(),
                reason: "listener already started".to_string(),
            });
        }
        self.identity.validate()?;

        // Create the endpoint before consuming the callback so a failed
        // listen (identity conflict) leaves this instance retryable.
        let endpoint = Endpoint::create(self.identity.as_str())
            .map_err(|err| from_channel(self.identity.as_str(), 0, err))?;

        let callback = self.callback.take().ok_or_else(|| PipeError::InvalidPipe {
            identity: self.identity.to_string(),
            reason: "listener already started".to_string(),
        })?;

        let worker = Worker {
            endpoint,
            callback,
            identity: self.identity.clone(),
            timeout: self.timeout,
            max_messages: self.max_messages,
            die_code: self.die_code.clone(),
            response_channel: self.response_channel.clone(),
            buffer_size: self.buffer_size,
        };

        let status = Arc::clone(&self.status);
        status.store(ListenerStatus::Running as u8, Ordering::SeqCst);

        let handle = std::thread::Builder::new()
            .name(format!("pipecom-{}", self.identity))
            .spawn(move || {
                let mut worker = worker;
                let terminal = worker.serve();
                info!(identity = %worker.identity, status = ?terminal, "listener stopped");
                status.store(terminal as u8, Ordering::SeqCst);
            })
            .map_err(|err| {
                self.status
                    .store(ListenerStatus::Idle as u8, Ordering::SeqCst);
                PipeError::Unknown {
                    identity: self.identity.to_string(),
                    detail: format!("failed to spawn listener thread: {err}"),
                }
            })?;

        if !self.daemon {
            self.handle = Some(handle);
        }
        Ok(())
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ListenerStatus {
        ListenerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// The identity this listener serves.
    pub fn identity(&self) -> &ChannelId {
        &self.identity
    }

    /// Block until the listener reaches a terminal state.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            return;
        }
        // Detached thread: watch the shared status cell instead.
        while self.status() == ListenerStatus::Running {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl From<&Listener> for ChannelId {
    fn from(listener: &Listener) -> Self {
        listener.identity.clone()
    }
}

struct Worker {
    endpoint: Endpoint,
    callback: Box<Callback>,
    identity: ChannelId,
    timeout: Duration,
    max_messages: u64,
    die_code: Vec<u8>,
    response_channel: Option<ChannelId>,
    buffer_size: usize,
}

impl Worker {
    // &mut: the Windows adapter re-arms its pipe instance per accept.
    fn serve(&mut self) -> ListenerStatus {
        let mut processed: u64 = 0;

        loop {
            let idle = Deadline::after(self.timeout);
            let mut inbound = match self.endpoint.accept(&idle, self.buffer_size) {
                Ok(inbound) => inbound,
                Err(ChannelError::Timeout { .. }) => {
                    debug!(identity = %self.identity, "idle timeout elapsed");
                    return ListenerStatus::StoppedTimeout;
                }
                Err(err) => {
                    warn!(identity = %self.identity, %err, "accept failed");
                    return ListenerStatus::StoppedError;
                }
            };

            let raw = match inbound.recv(&Deadline::after(self.timeout)) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(identity = %self.identity, %err, "dropping connection: read failed");
                    continue;
                }
            };
            if raw.is_empty() {
                // Writer connected and closed without sending anything.
                continue;
            }

            for line in wire::split(&raw) {
                let payload = match wire::decode(line) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(identity = %self.identity, %err, "discarding malformed message");
                        continue;
                    }
                };

                if wire::token_eq(&payload, &self.die_code) {
                    self.acknowledge(&mut inbound);
                    debug!(identity = %self.identity, "die code received");
                    return ListenerStatus::StoppedDieCode;
                }

                let result = self.invoke(&payload);
                self.acknowledge(&mut inbound);

                if let (Some(value), Some(response)) = (result, self.response_channel.as_ref()) {
                    if let Err(err) = sender::send(
                        response.clone(),
                        &value,
                        RESPONSE_TIMEOUT,
                        RESPONSE_MAX_ATTEMPTS,
                    ) {
                        warn!(
                            identity = %self.identity,
                            response = %response,
                            %err,
                            "failed to forward callback result"
                        );
                    }
                }

                processed += 1;
                if self.max_messages > 0 && processed >= self.max_messages {
                    return ListenerStatus::StoppedMaxMessages;
                }
            }
        }
    }

    fn invoke(&self, payload: &[u8]) -> Option<Vec<u8>> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(payload))) {
            Ok(result) => result,
            Err(_) => {
                warn!(identity = %self.identity, "callback panicked; continuing without result");
                None
            }
        }
    }

    fn acknowledge(&self, inbound: &mut Inbound) {
        let ack = wire::encode(wire::ACK);
        if let Err(err) = inbound.reply(&ack, &Deadline::after(ACK_TIMEOUT)) {
            warn!(identity = %self.identity, %err, "failed to deliver acknowledgment");
        }
    }
}
