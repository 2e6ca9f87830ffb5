//! Session operations abstraction
//!
//! This module provides the session operations pattern that allows
//! transparent switching between plain TCP and TLS connections.
//!
//! Every session is backed by a `TcpStream`. The HTTP/2 transport puts that
//! socket in non-blocking mode and polls it without holding the session
//! lock, so writers are never stuck behind a reader waiting for the peer.

use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Session operations trait
///
/// This trait defines the operations that can be performed on a session,
/// abstracting over plain TCP and TLS connections.
pub trait SessionOps: Send {
    /// Read data from the session
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write data to the session
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Flush buffered output
    fn flush(&mut self) -> Result<()>;

    /// Close the session
    fn close(&mut self) -> Result<()>;

    /// The socket carrying this session
    fn socket(&self) -> &TcpStream;

    /// Whether the session is TLS-wrapped
    fn is_secure(&self) -> bool {
        false
    }

    /// Write the whole buffer, retrying short writes
    fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(Error::ConnectionClosed),
                n => buf = &buf[n..],
            }
        }
        self.flush()
    }
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
}

/// Poll a socket for readiness
///
/// Returns true if the socket is ready for the requested operation. An
/// interrupted poll reports "not ready" so callers simply poll again.
pub fn poll_socket(stream: &TcpStream, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd: stream.as_raw_fd(),
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1); // -1 = infinite

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(Error::Io(err));
    }

    Ok(result > 0)
}

/// Plain file descriptor session operations
pub struct FdSessionOps {
    stream: TcpStream,
}

impl FdSessionOps {
    /// Create a new FD session operations from a TCP stream
    pub fn new(stream: TcpStream) -> Self {
        FdSessionOps { stream }
    }
}

impl SessionOps for FdSessionOps {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from)
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush().map_err(Error::from)
    }

    fn close(&mut self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(Error::Io(e)),
            _ => Ok(()),
        }
    }

    fn socket(&self) -> &TcpStream {
        &self.stream
    }
}
