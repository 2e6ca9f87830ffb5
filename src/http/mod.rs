//! HTTP transport layer
//!
//! This module provides the byte-stream plumbing the HTTP/2 core runs on.
//!
//! # Architecture
//!
//! The transport uses a session operations abstraction pattern that allows
//! seamless switching between plain TCP and TLS connections:
//!
//! - `SessionOps` trait defines operations (read, write, flush, close)
//! - `FdSessionOps` implements them for a plain `TcpStream`
//! - `tls::TlsSessionOps` implements them over an OpenSSL stream
//! - All HTTP/2 code is transparent to the underlying transport
//!
//! # Examples
//!
//! ```no_run
//! use h2push::http::h2::{Handler, H2Message, Connection, ServerConfig, Server};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let handler = |conn: &Arc<Connection>, msg: H2Message| {
//!     let pushed = conn.push(msg.stream_id, "GET", "/style.css", &[])?;
//!     pushed.send_response(200, &[("content-type", "text/css")], b"h1 {}")?;
//!     conn.send_response(msg.stream_id, 200, &[("content-type", "text/html")], b"<html/>")
//! };
//!
//! let config = ServerConfig::builder().host("127.0.0.1").port(8443).build()?;
//! let server = Server::bind(config, Arc::new(handler))?;
//! server.run()?;
//! # Ok(())
//! # }
//! ```

pub mod h2;
pub mod session;
pub mod tls;

pub use session::{FdSessionOps, PollEvents, SessionOps};

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,
}

