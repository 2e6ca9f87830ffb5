//! Shared transport handle
//!
//! One connection has a reader thread and a writer thread on the same
//! session. The session sits behind a mutex and its socket is switched to
//! non-blocking mode, so the mutex is only ever held for a single read or
//! write attempt. When the session would block (no bytes yet, or only part
//! of a TLS record) the lock is released before the caller polls the
//! socket. A peer that stalls mid-record therefore never holds up the
//! writer.
//!
//! Closing shuts the socket down through a cloned handle, which wakes a
//! pending poll without needing the session mutex.

use super::error::{Error, Result};
use crate::http::session::{poll_socket, PollEvents, SessionOps};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub struct Transport {
    session: Mutex<Box<dyn SessionOps>>,
    control: TcpStream,
    secure: bool,
    closed: AtomicBool,
    poll_interval: Duration,
    /// How long a write may go without progress
    write_timeout: Option<Duration>,
}

impl Transport {
    /// Take over an established session and make its socket non-blocking
    pub fn new(session: Box<dyn SessionOps>, poll_interval: Duration, write_timeout: Option<Duration>) -> Result<Self> {
        let control = session.socket().try_clone()?;
        control.set_nonblocking(true)?;
        let secure = session.is_secure();

        Ok(Transport {
            session: Mutex::new(session),
            control,
            secure,
            closed: AtomicBool::new(false),
            poll_interval,
            write_timeout,
        })
    }

    fn session(&self) -> MutexGuard<'_, Box<dyn SessionOps>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the session is TLS-wrapped
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.control.peer_addr().ok()
    }

    /// Read whatever is available, blocking until something is
    ///
    /// Returns 0 at end of stream or once the transport is closed.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if !self.is_open() {
                return Ok(0);
            }
            match self.session().read(buf) {
                Err(e) if would_block(&e) => {}
                other => return Ok(other?),
            }
            poll_socket(&self.control, PollEvents::Read, Some(self.poll_interval))?;
        }
    }

    /// Write and flush the whole buffer
    ///
    /// Fails with `TimedOut` once the peer has accepted nothing for the
    /// configured write timeout.
    pub fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        let mut progress = Instant::now();

        while !buf.is_empty() {
            if !self.is_open() {
                return Err(Error::ConnectionClosed);
            }
            match self.session().write(buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => {
                    buf = &buf[n..];
                    progress = Instant::now();
                    continue;
                }
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(e.into()),
            }

            let wait = match self.write_timeout {
                Some(timeout) => {
                    let left = timeout.saturating_sub(progress.elapsed());
                    if left.is_zero() {
                        return Err(Error::Io(io::Error::new(io::ErrorKind::TimedOut, "peer stopped reading")));
                    }
                    left.min(self.poll_interval)
                }
                None => self.poll_interval,
            };
            poll_socket(&self.control, PollEvents::Write, Some(wait))?;
        }

        self.session().flush()?;
        Ok(())
    }

    /// Close the transport; only the first call has any effect
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // close_notify, then the socket itself
        let _ = self.session().close();
        match self.control.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => {
                tracing::trace!(error = %e, "socket shutdown failed")
            }
            _ => {}
        }
    }
}

fn would_block(e: &crate::http::Error) -> bool {
    matches!(e, crate::http::Error::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
}

impl io::Read for &Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Transport::read(*self, buf).map_err(|e| match e {
            Error::Io(e) => e,
            Error::Http(crate::http::Error::Io(e)) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        })
    }
}
