//! TLS support for HTTP/2 connections
//!
//! This module is the TLS collaborator of the HTTP/2 core: it turns an
//! accepted `TcpStream` into an encrypted session that implements
//! `SessionOps`, negotiating `h2` through ALPN.
//!
//! # Architecture
//!
//! 1. `TlsConfig` holds the built OpenSSL context (versions, ALPN, identity)
//! 2. `TlsSessionOps` implements the `SessionOps` trait for encrypted I/O
//! 3. The HTTP/2 code stays unchanged - it transparently uses TLS operations
//!
//! # Examples
//!
//! ```no_run
//! use h2push::http::tls::{TlsConfig, TlsVersion};
//! use std::net::TcpListener;
//!
//! let tls_config = TlsConfig::server()
//!     .cert_file("server.pem")
//!     .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
//!     .build()
//!     .unwrap();
//!
//! let listener = TcpListener::bind("127.0.0.1:8443").unwrap();
//! let (tcp_stream, _) = listener.accept().unwrap();
//! let tls_session = tls_config.accept(tcp_stream).unwrap();
//! assert_eq!(tls_session.alpn_protocol(), Some(b"h2".to_vec()));
//! ```

pub mod builtin_cert;
pub mod config;
pub mod session;

pub use config::{ClientConfigBuilder, ServerConfigBuilder, TlsConfig, TlsError, TlsVersion};
pub use session::TlsSessionOps;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;

/// ALPN protocol identifier for HTTP/2 over TLS
pub const ALPN_H2: &str = "h2";
