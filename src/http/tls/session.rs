//! TLS session operations
//!
//! This module implements the SessionOps trait for TLS connections,
//! enabling transparent switching between plain TCP and TLS I/O.

use super::config::{TlsConfig, TlsError};
use crate::http::session::SessionOps;
use crate::http::{Error, Result as HttpResult};
use openssl::ssl::{Ssl, SslStream};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// TLS session operations
///
/// Implements SessionOps trait for TLS-encrypted connections.
/// Wraps an OpenSSL SslStream and provides read/write/close operations.
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    failed: bool,
}

/// Run `handshake` with a read/write deadline on the socket, then clear it
fn with_handshake_timeout<T>(
    tcp_stream: &TcpStream,
    timeout: Duration,
    handshake: impl FnOnce() -> std::result::Result<T, TlsError>,
) -> std::result::Result<T, TlsError> {
    tcp_stream.set_read_timeout(Some(timeout))?;
    tcp_stream.set_write_timeout(Some(timeout))?;
    let result = handshake();
    if result.is_ok() {
        tcp_stream.set_read_timeout(None)?;
        tcp_stream.set_write_timeout(None)?;
    }
    result
}

impl TlsSessionOps {
    /// Create a client TLS connection (perform handshake)
    pub fn connect(tcp_stream: TcpStream, config: &TlsConfig) -> std::result::Result<Self, TlsError> {
        let mut ssl = Ssl::new(&config.ctx)?;

        if let Some(ref servername) = config.servername {
            ssl.set_hostname(servername)?;
        }

        let control = tcp_stream.try_clone()?;
        let stream = with_handshake_timeout(&control, config.handshake_timeout, || {
            ssl.connect(tcp_stream)
                .map_err(|e| TlsError::HandshakeFailed(format!("Connection failed: {}", e)))
        })?;

        Ok(TlsSessionOps { stream, failed: false })
    }

    /// Accept a client connection with TLS (perform handshake)
    pub fn accept(tcp_stream: TcpStream, config: &TlsConfig) -> std::result::Result<Self, TlsError> {
        let ssl = Ssl::new(&config.ctx)?;

        let control = tcp_stream.try_clone()?;
        let stream = with_handshake_timeout(&control, config.handshake_timeout, || {
            ssl.accept(tcp_stream)
                .map_err(|e| TlsError::HandshakeFailed(format!("Accept failed: {}", e)))
        })?;

        Ok(TlsSessionOps { stream, failed: false })
    }

    /// Protocol selected through ALPN, if any
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.stream.ssl().selected_alpn_protocol().map(|p| p.to_vec())
    }

    /// Negotiated TLS version (e.g. "TLSv1.3")
    pub fn version(&self) -> &'static str {
        self.stream.ssl().version_str()
    }

    /// Check if TLS failed
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// A non-blocking socket that is not ready yet is not a failure
    fn fail(&mut self, e: io::Error) -> Error {
        if e.kind() != io::ErrorKind::WouldBlock {
            self.failed = true;
        }
        Error::Io(e)
    }
}

impl SessionOps for TlsSessionOps {
    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        self.stream.read(buf).map_err(|e| self.fail(e))
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        self.stream.write(buf).map_err(|e| self.fail(e))
    }

    fn flush(&mut self) -> HttpResult<()> {
        self.stream.flush().map_err(|e| self.fail(e))
    }

    fn close(&mut self) -> HttpResult<()> {
        // Send close_notify unless the session already broke
        if !self.failed {
            let _ = self.stream.shutdown();
        }

        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(Error::Io(e)),
            _ => Ok(()),
        }
    }

    fn socket(&self) -> &TcpStream {
        self.stream.get_ref()
    }

    fn is_secure(&self) -> bool {
        true
    }
}
