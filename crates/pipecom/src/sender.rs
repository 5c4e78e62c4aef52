use std::time::Duration;

use pipecom_channel::{ChannelError, Deadline, Outbound};
use pipecom_wire as wire;
use tracing::debug;

use crate::error::{PipeError, Result};
use crate::identity::ChannelId;
use crate::DEFAULT_BUFFER_SIZE;

/// Send one message to a named listener and wait for its acknowledgment.
///
/// `timeout` bounds each attempt (connect plus ack wait); zero waits
/// forever. `max_attempts` bounds the retry budget; zero retries forever.
/// Backoff between attempts is the caller's policy; none is applied here.
///
/// Returns `Ok(true)` once an acknowledgment arrives. Exhausting the
/// attempt budget on connect-class failures returns `Ok(false)`, an
/// expected outcome when no listener is up. Exhausting it after a
/// successful write ends in [`PipeError::Timeout`] instead, because the
/// outcome is ambiguous: the listener may have processed the message even
/// though the acknowledgment never arrived. Retries re-send the payload,
/// so duplicate processing is possible in that window.
pub fn send(
    target: impl Into<ChannelId>,
    payload: &[u8],
    timeout: Duration,
    max_attempts: u32,
) -> Result<bool> {
    let identity = target.into();
    identity.validate()?;
    let encoded = wire::encode(payload);

    let mut attempts: u32 = 0;
    let mut timed_out_last = false;

    loop {
        attempts += 1;
        match attempt(&identity, &encoded, timeout) {
            Ok(()) => {
                debug!(identity = %identity, attempts, "message acknowledged");
                return Ok(true);
            }
            Err(AttemptFailure::Connect(err)) => {
                debug!(identity = %identity, attempt = attempts, %err, "connect attempt failed");
                timed_out_last = false;
            }
            Err(AttemptFailure::AckTimeout) => {
                debug!(identity = %identity, attempt = attempts, "no acknowledgment before deadline");
                timed_out_last = true;
            }
            Err(AttemptFailure::Fatal(err)) => return Err(err),
        }

        if max_attempts != 0 && attempts >= max_attempts {
            if timed_out_last {
                return Err(PipeError::Timeout {
                    identity: identity.to_string(),
                    attempts,
                });
            }
            return Ok(false);
        }
    }
}

enum AttemptFailure {
    /// Could not reach a listener; retrying may help.
    Connect(ChannelError),
    /// The write went through but no acknowledgment arrived in time.
    AckTimeout,
    /// Not worth retrying.
    Fatal(PipeError),
}

fn attempt(
    identity: &ChannelId,
    encoded: &[u8],
    timeout: Duration,
) -> std::result::Result<(), AttemptFailure> {
    let deadline = Deadline::after(timeout);

    let mut connection = Outbound::connect(identity.as_str(), &deadline).map_err(|err| match err {
        ChannelError::ConnectionFailed { .. } | ChannelError::Busy { .. } => {
            AttemptFailure::Connect(err)
        }
        ChannelError::PermissionDenied { source, .. } => {
            AttemptFailure::Fatal(PipeError::PermissionDenied {
                identity: identity.to_string(),
                source,
            })
        }
        other => AttemptFailure::Fatal(PipeError::Unknown {
            identity: identity.to_string(),
            detail: other.to_string(),
        }),
    })?;

    match connection.send(encoded, &deadline) {
        Ok(()) => {}
        Err(ChannelError::Timeout { .. }) => {
            // The deadline cut the write short; a partial line may have
            // reached the listener, so treat it like a lost acknowledgment.
            return Err(AttemptFailure::AckTimeout);
        }
        Err(err) => {
            // Nothing reached the listener yet; plain retry territory.
            return Err(AttemptFailure::Connect(err));
        }
    }

    // From here on a failure is ambiguous: the listener may have processed
    // the message even though the acknowledgment never made it back.
    let reply = match connection.recv_reply(&deadline, DEFAULT_BUFFER_SIZE) {
        Ok(reply) => reply,
        Err(_) => return Err(AttemptFailure::AckTimeout),
    };

    let Some(first) = wire::split(&reply).into_iter().next() else {
        // The replier connected and vanished without a full line.
        return Err(AttemptFailure::AckTimeout);
    };

    match wire::decode(first) {
        Ok(decoded) if wire::token_eq(&decoded, wire::ACK) => Ok(()),
        Ok(decoded) => Err(AttemptFailure::Fatal(PipeError::Unknown {
            identity: identity.to_string(),
            detail: format!(
                "expected acknowledgment, received {} unexpected byte(s)",
                decoded.len()
            ),
        })),
        Err(err) => Err(AttemptFailure::Fatal(PipeError::Unknown {
            identity: identity.to_string(),
            detail: format!("undecodable acknowledgment: {err}"),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn empty_identity_is_rejected_before_any_attempt() {
        let err = send("", b"payload", Duration::from_secs(1), 1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPipe);
    }
}
