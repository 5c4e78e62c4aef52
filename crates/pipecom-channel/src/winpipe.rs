//! Windows named-pipe adapter.
//!
//! A channel identity maps to `\\.\pipe\<identity>`. Each connection is one
//! duplex message-mode pipe instance, so replies travel back over the same
//! handle instead of a companion FIFO. Deadlines are enforced with
//! overlapped I/O and event waits throughout; there is no signal-based
//! strategy on this platform.

use std::ffi::c_void;
use std::os::windows::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info};

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_IO_PENDING,
    ERROR_MORE_DATA, ERROR_PIPE_BUSY, ERROR_PIPE_CONNECTED, GENERIC_READ, GENERIC_WRITE, HANDLE,
    INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, ReadFile, WriteFile, FILE_FLAG_FIRST_PIPE_INSTANCE,
    FILE_FLAG_OVERLAPPED, OPEN_EXISTING,
};
use windows_sys::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, SetNamedPipeHandleState,
    PIPE_ACCESS_DUPLEX, PIPE_READMODE_MESSAGE, PIPE_TYPE_MESSAGE, PIPE_UNLIMITED_INSTANCES,
    PIPE_WAIT,
};
use windows_sys::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

use crate::deadline::Deadline;
use crate::error::{ChannelError, Result};

const PIPE_BUFFER_HINT: u32 = 65536;

/// Pipe-namespace path of the data channel for an identity.
pub fn data_path(identity: &str) -> PathBuf {
    PathBuf::from(format!(r"\\.\pipe\{identity}"))
}

/// Replies share the duplex instance; the ack path equals the data path.
pub fn ack_path(identity: &str) -> PathBuf {
    data_path(identity)
}

fn wide_path(path: &Path) -> Vec<u16> {
    path.as_os_str().encode_wide().chain(std::iter::once(0)).collect()
}

fn last_error() -> std::io::Error {
    // SAFETY: GetLastError takes no arguments and cannot fail.
    std::io::Error::from_raw_os_error(unsafe { GetLastError() } as i32)
}

/// Owned event handle for overlapped waits.
struct Event(HANDLE);

impl Event {
    fn new() -> Result<Self> {
        // SAFETY: manual-reset unnamed event with no security attributes.
        let handle = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
        if handle.is_null() {
            return Err(ChannelError::Io(last_error()));
        }
        Ok(Self(handle))
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // SAFETY: handle was created by CreateEventW and is owned here.
        unsafe { CloseHandle(self.0) };
    }
}

/// Wait for an overlapped operation, bounded by `deadline`. Returns the
/// transferred byte count.
fn wait_overlapped(
    handle: HANDLE,
    overlapped: &mut OVERLAPPED,
    event: &Event,
    deadline: &Deadline,
    path: &Path,
) -> Result<u32> {
    let started = Instant::now();
    let wait_ms = match deadline.remaining() {
        Some(rem) => rem.as_millis().min(u128::from(u32::MAX - 1)) as u32,
        None => INFINITE,
    };

    // SAFETY: `event.0` is a valid event handle for the wait.
    let wait = unsafe { WaitForSingleObject(event.0, wait_ms) };
    if wait == WAIT_TIMEOUT {
        // SAFETY: cancels only the operation tied to this OVERLAPPED.
        unsafe {
            CancelIoEx(handle, overlapped);
            let mut transferred = 0u32;
            GetOverlappedResult(handle, overlapped, &mut transferred, 1);
        }
        return Err(ChannelError::Timeout {
            path: path.to_path_buf(),
            waited: started.elapsed(),
        });
    }
    if wait != WAIT_OBJECT_0 {
        return Err(ChannelError::Io(last_error()));
    }

    let mut transferred = 0u32;
    // SAFETY: the operation has signalled; `overlapped` outlives the call.
    let ok = unsafe { GetOverlappedResult(handle, overlapped, &mut transferred, 0) };
    if ok == 0 {
        return Err(ChannelError::Io(last_error()));
    }
    Ok(transferred)
}

fn overlapped_with_event(event: &Event) -> OVERLAPPED {
    // SAFETY: OVERLAPPED is a plain C struct; zeroed is its documented
    // initial state.
    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    overlapped.hEvent = event.0;
    overlapped
}

/// Reader role: exclusive owner of a channel identity.
pub struct Endpoint {
    wide_name: Vec<u16>,
    path: PathBuf,
    next_instance: HANDLE,
}

// SAFETY: the pipe handles are only used from one thread at a time; the
// raw pointer type is what keeps HANDLE from being Send automatically.
unsafe impl Send for Endpoint {}

impl Endpoint {
    /// Create the first pipe instance for `identity`.
    ///
    /// `FILE_FLAG_FIRST_PIPE_INSTANCE` turns a second owner of the same
    /// identity into [`ChannelError::Conflict`].
    pub fn create(identity: &str) -> Result<Self> {
        let path = data_path(identity);
        let wide_name = wide_path(&path);
        let instance = create_instance(&wide_name, &path, true)?;
        info!(?path, "listening on named pipe");
        Ok(Self {
            wide_name,
            path,
            next_instance: instance,
        })
    }

    /// Wait for a client to connect, bounded by `deadline`.
    pub fn accept(&mut self, deadline: &Deadline, buffer_size: usize) -> Result<Inbound> {
        let handle = self.next_instance;

        let event = Event::new()?;
        let mut overlapped = overlapped_with_event(&event);

        // SAFETY: `handle` is an unconnected pipe instance created with
        // FILE_FLAG_OVERLAPPED; `overlapped` lives past the wait below.
        let ok = unsafe { ConnectNamedPipe(handle, &mut overlapped) };
        if ok == 0 {
            match unsafe { GetLastError() } {
                ERROR_PIPE_CONNECTED => {}
                ERROR_IO_PENDING => {
                    wait_overlapped(handle, &mut overlapped, &event, deadline, &self.path)?;
                }
                _ => return Err(ChannelError::Io(last_error())),
            }
        }
        debug!(path = ?self.path, "client connected");

        // Pre-create the next instance so the identity stays owned while
        // this connection is serviced.
        self.next_instance = create_instance(&self.wide_name, &self.path, false)?;

        Ok(Inbound {
            handle,
            path: self.path.clone(),
            buffer_size,
        })
    }

    /// The pipe path this endpoint owns.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // SAFETY: handle is owned and unconnected.
        unsafe { CloseHandle(self.next_instance) };
    }
}

fn create_instance(wide_name: &[u16], path: &Path, first: bool) -> Result<HANDLE> {
    let mut open_mode = PIPE_ACCESS_DUPLEX | FILE_FLAG_OVERLAPPED;
    if first {
        open_mode |= FILE_FLAG_FIRST_PIPE_INSTANCE;
    }

    // SAFETY: `wide_name` is NUL-terminated; a null security descriptor
    // yields the default DACL.
    let handle = unsafe {
        CreateNamedPipeW(
            wide_name.as_ptr(),
            open_mode,
            PIPE_TYPE_MESSAGE | PIPE_READMODE_MESSAGE | PIPE_WAIT,
            PIPE_UNLIMITED_INSTANCES,
            PIPE_BUFFER_HINT,
            PIPE_BUFFER_HINT,
            0,
            std::ptr::null(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        let err = last_error();
        return match err.raw_os_error().map(|e| e as u32) {
            Some(ERROR_ACCESS_DENIED) if first => Err(ChannelError::Conflict {
                path: path.to_path_buf(),
            }),
            Some(ERROR_ACCESS_DENIED) => Err(ChannelError::PermissionDenied {
                path: path.to_path_buf(),
                source: err,
            }),
            _ => Err(ChannelError::Io(err)),
        };
    }
    Ok(handle)
}

/// One accepted connection on the reader side.
pub struct Inbound {
    handle: HANDLE,
    path: PathBuf,
    buffer_size: usize,
}

// SAFETY: see Endpoint.
unsafe impl Send for Inbound {}

impl Inbound {
    /// Read one complete message from the connected client.
    pub fn recv(&mut self, deadline: &Deadline) -> Result<Vec<u8>> {
        read_message(self.handle, deadline, &self.path, self.buffer_size)
    }

    /// Write reply bytes back over the same duplex instance.
    pub fn reply(&mut self, bytes: &[u8], deadline: &Deadline) -> Result<()> {
        write_all(self.handle, bytes, deadline, &self.path)
    }
}

impl Drop for Inbound {
    fn drop(&mut self) {
        // SAFETY: handle is a connected pipe instance owned here.
        unsafe {
            FlushFileBuffers(self.handle);
            DisconnectNamedPipe(self.handle);
            CloseHandle(self.handle);
        }
    }
}

/// Writer role: one connection to a named endpoint.
pub struct Outbound {
    handle: HANDLE,
    path: PathBuf,
}

// SAFETY: see Endpoint.
unsafe impl Send for Outbound {}

impl Outbound {
    /// Connect to the endpoint owning `identity`, bounded by `deadline`.
    ///
    /// `ERROR_PIPE_BUSY` (instances exist but none free) surfaces as
    /// [`ChannelError::Busy`] once the deadline elapses; a missing pipe
    /// surfaces as [`ChannelError::ConnectionFailed`].
    pub fn connect(identity: &str, deadline: &Deadline) -> Result<Self> {
        let path = data_path(identity);
        let wide_name = wide_path(&path);

        loop {
            // SAFETY: `wide_name` is NUL-terminated and outlives the call.
            let handle = unsafe {
                CreateFileW(
                    wide_name.as_ptr(),
                    GENERIC_READ | GENERIC_WRITE,
                    0,
                    std::ptr::null(),
                    OPEN_EXISTING,
                    FILE_FLAG_OVERLAPPED,
                    std::ptr::null_mut(),
                )
            };
            if handle != INVALID_HANDLE_VALUE {
                let mut mode = PIPE_READMODE_MESSAGE;
                // SAFETY: `handle` is a connected pipe client handle.
                let ok = unsafe {
                    SetNamedPipeHandleState(
                        handle,
                        &mut mode,
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                    )
                };
                if ok == 0 {
                    let err = last_error();
                    // SAFETY: handle is owned and must not leak.
                    unsafe { CloseHandle(handle) };
                    return Err(ChannelError::Io(err));
                }
                debug!(?path, "connected to named pipe");
                return Ok(Self { handle, path });
            }

            let err = last_error();
            match err.raw_os_error().map(|e| e as u32) {
                Some(ERROR_PIPE_BUSY) => {
                    if deadline.expired() {
                        return Err(ChannelError::Busy { path });
                    }
                    std::thread::sleep(deadline.poll_wait());
                }
                Some(ERROR_FILE_NOT_FOUND) => {
                    if deadline.expired() {
                        return Err(ChannelError::ConnectionFailed { path, source: err });
                    }
                    std::thread::sleep(deadline.poll_wait());
                }
                Some(ERROR_ACCESS_DENIED) => {
                    return Err(ChannelError::PermissionDenied { path, source: err });
                }
                _ => return Err(ChannelError::Io(err)),
            }
        }
    }

    /// Send one message, bounded by `deadline`. Message-mode framing
    /// delimits it; the handle stays open for the reply.
    pub fn send(&mut self, bytes: &[u8], deadline: &Deadline) -> Result<()> {
        write_all(self.handle, bytes, deadline, &self.path)
    }

    /// Read one reply message, bounded by `deadline`.
    pub fn recv_reply(&mut self, deadline: &Deadline, buffer_size: usize) -> Result<Vec<u8>> {
        read_message(self.handle, deadline, &self.path, buffer_size)
    }

    /// The pipe path this connection targets.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Outbound {
    fn drop(&mut self) {
        // SAFETY: handle is owned by this connection.
        unsafe { CloseHandle(self.handle) };
    }
}

fn read_message(
    handle: HANDLE,
    deadline: &Deadline,
    path: &Path,
    buffer_size: usize,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut chunk = vec![0u8; buffer_size.max(1)];

    loop {
        let event = Event::new()?;
        let mut overlapped = overlapped_with_event(&event);
        let mut read = 0u32;

        // SAFETY: `chunk` outlives the overlapped operation because
        // wait_overlapped completes or cancels it before returning.
        let ok = unsafe {
            ReadFile(
                handle,
                chunk.as_mut_ptr() as *mut c_void,
                chunk.len() as u32,
                &mut read,
                &mut overlapped,
            )
        };

        let (transferred, more_data) = if ok != 0 {
            (read, false)
        } else {
            match unsafe { GetLastError() } {
                ERROR_IO_PENDING => {
                    match wait_overlapped(handle, &mut overlapped, &event, deadline, path) {
                        Ok(n) => (n, false),
                        Err(ChannelError::Io(err))
                            if err.raw_os_error() == Some(ERROR_MORE_DATA as i32) =>
                        {
                            (chunk.len() as u32, true)
                        }
                        Err(err) => return Err(err),
                    }
                }
                ERROR_MORE_DATA => (chunk.len() as u32, true),
                _ => return Err(ChannelError::Io(last_error())),
            }
        };

        out.extend_from_slice(&chunk[..transferred as usize]);
        if !more_data {
            return Ok(out);
        }
    }
}

fn write_all(handle: HANDLE, bytes: &[u8], deadline: &Deadline, path: &Path) -> Result<()> {
    let event = Event::new()?;
    let mut overlapped = overlapped_with_event(&event);
    let mut written = 0u32;

    // SAFETY: `bytes` outlives the overlapped operation because
    // wait_overlapped completes or cancels it before returning.
    let ok = unsafe {
        WriteFile(
            handle,
            bytes.as_ptr() as *const c_void,
            bytes.len() as u32,
            &mut written,
            &mut overlapped,
        )
    };
    if ok == 0 {
        match unsafe { GetLastError() } {
            ERROR_IO_PENDING => {
                wait_overlapped(handle, &mut overlapped, &event, deadline, path)?;
            }
            _ => return Err(ChannelError::Io(last_error())),
        }
    }
    Ok(())
}
