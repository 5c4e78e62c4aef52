//! POSIX FIFO adapter.
//!
//! A channel identity maps to a filesystem path (relative identities
//! resolve against the working directory). Each connection is one
//! open/write/close of the data FIFO by a writer; replies travel back over
//! a companion `<identity>_ack` FIFO because FIFOs are unidirectional.
//!
//! The ack FIFO is shared by every sender, so connections are serialized
//! with an advisory `flock(2)` on its read end: a writer holds the lock
//! from connect until drop, which keeps exactly one sender in flight and
//! guarantees each reply reaches the sender it was written for.
//!
//! Connect-time blocking is dual-strategy: a blocking `open(2)` guarded by
//! `alarm(2)` on the main thread, non-blocking readiness polls everywhere
//! else (see [`crate::alarm`]). All reads and writes after that point are
//! non-blocking with `poll(2)` waits, so every operation honors its
//! deadline.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info};

use crate::alarm::{AlarmGuard, WaitStrategy};
use crate::deadline::Deadline;
use crate::error::{ChannelError, Result};

/// Permission mode for created FIFOs, matching what peers of any uid need
/// to open the write end.
const FIFO_MODE: libc::mode_t = 0o666;

/// Filesystem path of the data FIFO for an identity.
pub fn data_path(identity: &str) -> PathBuf {
    PathBuf::from(identity)
}

/// Filesystem path of the acknowledgment FIFO for an identity.
pub fn ack_path(identity: &str) -> PathBuf {
    PathBuf::from(format!("{identity}_ack"))
}

/// Reader role: exclusive owner of a channel identity.
///
/// Creates the data and ack FIFOs on construction and unlinks them on every
/// exit path via `Drop`, verifying the entries are still the FIFOs it
/// created before removing them.
pub struct Endpoint {
    data_path: PathBuf,
    ack_path: PathBuf,
    data_inode: Option<(u64, u64)>,
    ack_inode: Option<(u64, u64)>,
}

impl Endpoint {
    /// Create both FIFOs for `identity`.
    ///
    /// Fails with [`ChannelError::Conflict`] if either FIFO already exists:
    /// two readers must never silently share one identity.
    pub fn create(identity: &str) -> Result<Self> {
        let data = data_path(identity);
        let ack = ack_path(identity);

        mkfifo(&data)?;
        if let Err(err) = mkfifo(&ack) {
            let _ = std::fs::remove_file(&data);
            return Err(err);
        }

        let data_inode = inode_of(&data);
        let ack_inode = inode_of(&ack);

        info!(path = ?data, "listening on fifo channel");

        Ok(Self {
            data_path: data,
            ack_path: ack,
            data_inode,
            ack_inode,
        })
    }

    /// Wait for a writer to connect, bounded by `deadline`.
    ///
    /// The read end is opened fresh per connection; the returned
    /// [`Inbound`] owns it until the message has been read and replied to.
    pub fn accept(&self, deadline: &Deadline, buffer_size: usize) -> Result<Inbound> {
        let file = open_read_nonblocking(&self.data_path)?;
        wait_readable(&file, deadline, &self.data_path)?;
        debug!(path = ?self.data_path, "writer connected");
        Ok(Inbound {
            file,
            data_path: self.data_path.clone(),
            ack_path: self.ack_path.clone(),
            buffer_size,
        })
    }

    /// The data path this endpoint owns.
    pub fn path(&self) -> &Path {
        &self.data_path
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        remove_if_same_fifo(&self.data_path, self.data_inode);
        remove_if_same_fifo(&self.ack_path, self.ack_inode);
    }
}

/// One accepted connection on the reader side.
pub struct Inbound {
    file: File,
    data_path: PathBuf,
    ack_path: PathBuf,
    buffer_size: usize,
}

impl Inbound {
    /// Read the complete bytes of this connection (until the writer closes).
    ///
    /// Returns an empty vector when the writer connected and closed without
    /// sending anything.
    pub fn recv(&mut self, deadline: &Deadline) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = vec![0u8; self.buffer_size.max(1)];
        loop {
            match self.file.read(&mut chunk) {
                Ok(0) => return Ok(out),
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    wait_readable(&self.file, deadline, &self.data_path)?;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(ChannelError::Io(err)),
            }
        }
    }

    /// Write reply bytes back to the connecting peer over the ack FIFO.
    ///
    /// Waits (bounded by `deadline`) for the peer to open the ack read end.
    pub fn reply(&mut self, bytes: &[u8], deadline: &Deadline) -> Result<()> {
        // Always a background-thread call: poll, never alarm.
        let mut file = open_write_poll(&self.ack_path, deadline)?;
        write_all_deadline(&mut file, bytes, deadline, &self.ack_path)
    }
}

/// Writer role: one connection to a named endpoint.
///
/// Holds the channel's send slot (an `flock` on the ack FIFO) for its whole
/// lifetime; dropping the connection releases the slot to the next sender.
pub struct Outbound {
    file: Option<File>,
    // Released by close on drop.
    _slot: File,
    data_path: PathBuf,
    ack_path: PathBuf,
}

impl Outbound {
    /// Connect to the endpoint owning `identity`, bounded by `deadline`.
    ///
    /// Fails with [`ChannelError::ConnectionFailed`] when no reader is
    /// listening within the deadline, and with [`ChannelError::Busy`] when
    /// another sender held the channel's send slot for the whole deadline.
    pub fn connect(identity: &str, deadline: &Deadline) -> Result<Self> {
        let data = data_path(identity);
        let ack = ack_path(identity);

        let slot = acquire_send_slot(&ack, deadline)?;
        let file = match WaitStrategy::for_current_thread() {
            WaitStrategy::Alarm => open_write_alarm(&data, deadline)?,
            WaitStrategy::Poll => open_write_poll(&data, deadline)?,
        };
        debug!(path = ?data, "connected to fifo channel");

        Ok(Self {
            file: Some(file),
            _slot: slot,
            data_path: data,
            ack_path: ack,
        })
    }

    /// Send one message and close the write end, bounded by `deadline`.
    ///
    /// Closing delimits the message: the reader treats writer-close as
    /// end-of-connection.
    pub fn send(&mut self, bytes: &[u8], deadline: &Deadline) -> Result<()> {
        let mut file = self.file.take().ok_or_else(|| {
            ChannelError::Io(std::io::Error::new(
                ErrorKind::NotConnected,
                "message already sent on this connection",
            ))
        })?;
        write_all_deadline(&mut file, bytes, deadline, &self.data_path)
    }

    /// Read one reply line from the ack channel, bounded by `deadline`.
    pub fn recv_reply(&mut self, deadline: &Deadline, buffer_size: usize) -> Result<Vec<u8>> {
        read_reply(&self.ack_path, deadline, buffer_size)
    }

    /// The data path this connection targets.
    pub fn path(&self) -> &Path {
        &self.data_path
    }
}

fn mkfifo(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        ChannelError::Io(std::io::Error::new(
            ErrorKind::InvalidInput,
            "channel path contains NUL",
        ))
    })?;

    // SAFETY: `c_path` is a valid NUL-terminated string for the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), FIFO_MODE) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EEXIST) => Err(ChannelError::Conflict {
            path: path.to_path_buf(),
        }),
        Some(libc::EACCES) | Some(libc::EPERM) => Err(ChannelError::PermissionDenied {
            path: path.to_path_buf(),
            source: err,
        }),
        _ => Err(ChannelError::Io(err)),
    }
}

fn inode_of(path: &Path) -> Option<(u64, u64)> {
    std::fs::symlink_metadata(path)
        .ok()
        .map(|m| (m.dev(), m.ino()))
}

fn remove_if_same_fifo(path: &Path, expected: Option<(u64, u64)>) {
    let Some((expected_dev, expected_ino)) = expected else {
        return;
    };
    if let Ok(metadata) = std::fs::symlink_metadata(path) {
        if metadata.file_type().is_fifo()
            && metadata.dev() == expected_dev
            && metadata.ino() == expected_ino
        {
            debug!(?path, "cleaning up fifo");
            let _ = std::fs::remove_file(path);
        } else {
            debug!(?path, "fifo identity changed; skipping cleanup");
        }
    }
}

/// Take the channel's exclusive send slot: an `flock` on a read end of the
/// ack FIFO. At most one sender per channel is past this point at a time,
/// so each reply on the shared ack FIFO has exactly one candidate reader.
fn acquire_send_slot(ack: &Path, deadline: &Deadline) -> Result<File> {
    let file = loop {
        match open_read_nonblocking(ack) {
            Ok(file) => break file,
            // No endpoint has created the fifos (yet).
            Err(ChannelError::ConnectionFailed { path, source }) => {
                if deadline.expired() {
                    return Err(ChannelError::ConnectionFailed { path, source });
                }
                std::thread::sleep(deadline.poll_wait());
            }
            Err(err) => return Err(err),
        }
    };

    loop {
        // SAFETY: `file` owns the descriptor for the duration of the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(file);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) => {
                if deadline.expired() {
                    return Err(ChannelError::Busy {
                        path: ack.to_path_buf(),
                    });
                }
                std::thread::sleep(deadline.poll_wait());
            }
            Some(libc::EINTR) => continue,
            _ => return Err(ChannelError::Io(err)),
        }
    }
}

fn open_read_nonblocking(path: &Path) -> Result<File> {
    // Opening a FIFO read end with O_NONBLOCK never blocks on a missing
    // writer; readiness is then observed via poll(2).
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|err| classify_open_error(path, err))
}

fn open_write_poll(path: &Path, deadline: &Deadline) -> Result<File> {
    loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => return Ok(file),
            // ENXIO: fifo exists but no reader has it open.
            // NotFound: no endpoint created the fifo (yet).
            Err(err)
                if err.raw_os_error() == Some(libc::ENXIO)
                    || err.kind() == ErrorKind::NotFound =>
            {
                if deadline.expired() {
                    return Err(ChannelError::ConnectionFailed {
                        path: path.to_path_buf(),
                        source: err,
                    });
                }
                std::thread::sleep(deadline.poll_wait());
            }
            Err(err) => return Err(classify_open_error(path, err)),
        }
    }
}

fn open_write_alarm(path: &Path, deadline: &Deadline) -> Result<File> {
    // A blocking open can only wait on an existing fifo; until the reader
    // creates it there is nothing to block on.
    while !path.exists() {
        if deadline.expired() {
            return Err(ChannelError::ConnectionFailed {
                path: path.to_path_buf(),
                source: std::io::Error::new(ErrorKind::NotFound, "no listener created the channel"),
            });
        }
        std::thread::sleep(deadline.poll_wait());
    }

    let _guard = AlarmGuard::arm(deadline);
    match OpenOptions::new().write(true).open(path) {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == ErrorKind::Interrupted => {
            // Alarm fired: no reader opened the fifo in time.
            Err(ChannelError::ConnectionFailed {
                path: path.to_path_buf(),
                source: err,
            })
        }
        Err(err) => Err(classify_open_error(path, err)),
    }
}

// A freshly opened FIFO read end reports EOF until a writer has connected,
// so the reply reader must not treat an early `read() == 0` as the reply.
// It waits on poll(2) events instead: POLLIN and POLLHUP only fire once a
// writer has come since our open.
fn read_reply(path: &Path, deadline: &Deadline, buffer_size: usize) -> Result<Vec<u8>> {
    let mut file = open_read_nonblocking(path)?;
    let mut out = Vec::new();
    let mut chunk = vec![0u8; buffer_size.max(1)];
    loop {
        let events = wait_events(&file, deadline, path, libc::POLLIN)?;
        if events & libc::POLLIN != 0 {
            loop {
                match file.read(&mut chunk) {
                    Ok(0) => return Ok(out),
                    Ok(n) => {
                        out.extend_from_slice(&chunk[..n]);
                        if out.contains(&b'\n') {
                            return Ok(out);
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => return Err(ChannelError::Io(err)),
                }
            }
        } else if events & libc::POLLHUP != 0 {
            // The replier connected and closed; whatever arrived is final.
            return Ok(out);
        }
    }
}

// POLLHUP without POLLIN still means a writer came and went: the
// connection happened, the read side will observe EOF.
fn wait_readable(file: &File, deadline: &Deadline, path: &Path) -> Result<()> {
    wait_events(file, deadline, path, libc::POLLIN).map(|_| ())
}

fn wait_events(
    file: &File,
    deadline: &Deadline,
    path: &Path,
    events: libc::c_short,
) -> Result<libc::c_short> {
    let started = Instant::now();
    loop {
        if deadline.expired() {
            return Err(ChannelError::Timeout {
                path: path.to_path_buf(),
                waited: started.elapsed(),
            });
        }

        let mut fds = libc::pollfd {
            fd: file.as_raw_fd(),
            events,
            revents: 0,
        };
        let timeout_ms = deadline.poll_wait().as_millis() as libc::c_int;

        // SAFETY: `fds` is a valid pollfd array of length 1 for the call.
        let rc = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(ChannelError::Io(err));
        }
        if rc > 0 && fds.revents & (events | libc::POLLHUP | libc::POLLERR) != 0 {
            return Ok(fds.revents);
        }
    }
}

/// Write every byte, waiting on POLLOUT whenever the pipe buffer is full,
/// so a stalled peer cannot hold the writer past its deadline.
fn write_all_deadline(
    file: &mut File,
    bytes: &[u8],
    deadline: &Deadline,
    path: &Path,
) -> Result<()> {
    set_nonblocking(file)?;
    let mut offset = 0;
    while offset < bytes.len() {
        match file.write(&bytes[offset..]) {
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                wait_events(file, deadline, path, libc::POLLOUT)?;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(ChannelError::Io(err)),
        }
    }
    file.flush()?;
    Ok(())
}

fn set_nonblocking(file: &File) -> Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: `fd` is an open descriptor owned by `file`.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(ChannelError::Io(std::io::Error::last_os_error()));
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    // SAFETY: as above; setting O_NONBLOCK is always valid.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(ChannelError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn classify_open_error(path: &Path, err: std::io::Error) -> ChannelError {
    match err.kind() {
        ErrorKind::PermissionDenied => ChannelError::PermissionDenied {
            path: path.to_path_buf(),
            source: err,
        },
        ErrorKind::NotFound => ChannelError::ConnectionFailed {
            path: path.to_path_buf(),
            source: err,
        },
        _ => ChannelError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn make_identity(tag: &str) -> String {
        let dir = PathBuf::from(format!(
            "/tmp/pipecom-fifo-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir.join("chan").to_string_lossy().into_owned()
    }

    fn cleanup(identity: &str) {
        if let Some(parent) = Path::new(identity).parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn create_conflict_on_second_endpoint() {
        let identity = make_identity("conflict");
        let first = Endpoint::create(&identity).expect("first endpoint should create");
        let second = Endpoint::create(&identity);
        assert!(matches!(second, Err(ChannelError::Conflict { .. })));
        drop(first);
        cleanup(&identity);
    }

    #[test]
    fn endpoint_cleans_up_fifos_on_drop() {
        let identity = make_identity("cleanup");
        let endpoint = Endpoint::create(&identity).expect("endpoint should create");
        assert!(data_path(&identity).exists());
        assert!(ack_path(&identity).exists());
        drop(endpoint);
        assert!(!data_path(&identity).exists());
        assert!(!ack_path(&identity).exists());
        cleanup(&identity);
    }

    #[test]
    fn connect_without_reader_fails_within_deadline() {
        let identity = make_identity("noreader");
        let started = Instant::now();
        let result = Outbound::connect(&identity, &Deadline::after(Duration::from_millis(300)));
        assert!(matches!(result, Err(ChannelError::ConnectionFailed { .. })));
        assert!(started.elapsed() < Duration::from_secs(3));
        cleanup(&identity);
    }

    #[test]
    fn accept_times_out_without_writer() {
        let identity = make_identity("accept-timeout");
        let endpoint = Endpoint::create(&identity).expect("endpoint should create");
        let started = Instant::now();
        let result = endpoint.accept(&Deadline::after(Duration::from_millis(200)), 4096);
        assert!(matches!(result, Err(ChannelError::Timeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(3));
        cleanup(&identity);
    }

    #[test]
    fn message_and_reply_roundtrip() {
        let identity = make_identity("roundtrip");
        let endpoint = Endpoint::create(&identity).expect("endpoint should create");
        let writer_identity = identity.clone();

        let writer = std::thread::spawn(move || {
            let deadline = Deadline::after(Duration::from_secs(5));
            let mut out =
                Outbound::connect(&writer_identity, &deadline).expect("writer should connect");
            out.send(b"ping\n", &deadline).expect("send should succeed");
            out.recv_reply(&deadline, 4096).expect("reply should arrive")
        });

        let deadline = Deadline::after(Duration::from_secs(5));
        let mut inbound = endpoint
            .accept(&deadline, 4096)
            .expect("endpoint should accept");
        let message = inbound.recv(&deadline).expect("recv should succeed");
        assert_eq!(message, b"ping\n");
        inbound
            .reply(b"pong\n", &deadline)
            .expect("reply should succeed");

        let reply = writer.join().expect("writer thread should finish");
        assert_eq!(reply, b"pong\n");

        drop(endpoint);
        cleanup(&identity);
    }

    #[test]
    fn empty_connection_yields_empty_message() {
        let identity = make_identity("empty");
        let endpoint = Endpoint::create(&identity).expect("endpoint should create");
        let writer_identity = identity.clone();

        let writer = std::thread::spawn(move || {
            let deadline = Deadline::after(Duration::from_secs(5));
            let out = Outbound::connect(&writer_identity, &deadline).expect("writer should connect");
            drop(out); // connect and close without sending
        });

        let deadline = Deadline::after(Duration::from_secs(5));
        let mut inbound = endpoint
            .accept(&deadline, 4096)
            .expect("endpoint should accept");
        let message = inbound.recv(&deadline).expect("recv should succeed");
        assert!(message.is_empty());

        writer.join().expect("writer thread should finish");
        drop(endpoint);
        cleanup(&identity);
    }

    #[test]
    fn sequential_connections_on_one_endpoint() {
        let identity = make_identity("sequential");
        let endpoint = Endpoint::create(&identity).expect("endpoint should create");

        for i in 0..3u32 {
            let writer_identity = identity.clone();
            let payload = format!("msg-{i}\n");
            let expected = payload.clone();

            let writer = std::thread::spawn(move || {
                let deadline = Deadline::after(Duration::from_secs(5));
                let mut out =
                    Outbound::connect(&writer_identity, &deadline).expect("writer should connect");
                out.send(payload.as_bytes(), &deadline)
                    .expect("send should succeed");
            });

            let deadline = Deadline::after(Duration::from_secs(5));
            let mut inbound = endpoint
                .accept(&deadline, 4096)
                .expect("endpoint should accept");
            let message = inbound.recv(&deadline).expect("recv should succeed");
            assert_eq!(message, expected.as_bytes());
            writer.join().expect("writer thread should finish");
        }

        drop(endpoint);
        cleanup(&identity);
    }

    #[test]
    fn send_respects_deadline_when_reader_stalls() {
        let identity = make_identity("stalled");
        let endpoint = Endpoint::create(&identity).expect("endpoint should create");
        let writer_identity = identity.clone();

        let writer = std::thread::spawn(move || {
            let connect_deadline = Deadline::after(Duration::from_secs(5));
            let mut out = Outbound::connect(&writer_identity, &connect_deadline)
                .expect("writer should connect");
            // Larger than any kernel pipe buffer, so the write must stall.
            let payload = vec![b'x'; 4 << 20];
            let started = Instant::now();
            let result = out.send(&payload, &Deadline::after(Duration::from_secs(1)));
            (result, started.elapsed())
        });

        // Accept the connection but never read from it.
        let inbound = endpoint
            .accept(&Deadline::after(Duration::from_secs(5)), 4096)
            .expect("endpoint should accept");

        let (result, elapsed) = writer.join().expect("writer thread should finish");
        assert!(matches!(result, Err(ChannelError::Timeout { .. })));
        assert!(elapsed >= Duration::from_millis(900), "returned at {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "returned at {elapsed:?}");

        drop(inbound);
        drop(endpoint);
        cleanup(&identity);
    }

    #[test]
    fn connect_is_exclusive_per_channel() {
        let identity = make_identity("slot");
        let endpoint = Endpoint::create(&identity).expect("endpoint should create");
        let reader_identity = identity.clone();

        let reader = std::thread::spawn(move || {
            let deadline = Deadline::after(Duration::from_secs(5));
            let mut inbound = endpoint
                .accept(&deadline, 4096)
                .expect("endpoint should accept");
            inbound.recv(&deadline).expect("recv should succeed")
        });

        let deadline = Deadline::after(Duration::from_secs(5));
        let mut first =
            Outbound::connect(&identity, &deadline).expect("first writer should connect");

        // The send slot is held until `first` is dropped.
        let contended = Outbound::connect(&identity, &Deadline::after(Duration::from_millis(300)));
        assert!(matches!(contended, Err(ChannelError::Busy { .. })));

        first.send(b"solo\n", &deadline).expect("send should succeed");
        drop(first);

        let message = reader.join().expect("reader thread should finish");
        assert_eq!(message, b"solo\n");
        cleanup(&identity);
    }
}
