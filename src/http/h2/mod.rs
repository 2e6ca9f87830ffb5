//! HTTP/2 connection and stream core
//!
//! This module turns an accepted byte stream (plain TCP or TLS with ALPN
//! `h2`) into a multiplexed HTTP/2 connection, and lets the application push
//! server-initiated streams onto it.
//!
//! # Architecture
//!
//! - [`settings`], [`frames`] and [`codec`]: SETTINGS values, frame objects
//!   and their wire encoding (RFC 7540 Section 4 and 6)
//! - [`hpack`]: ordered header lists and the connection's stateful HPACK
//!   contexts
//! - [`stream`] and [`stream_table`]: the per-stream state machine and the
//!   per-connection registry that allocates ids and enforces the
//!   concurrent-stream limit
//! - [`flow_control`]: send and receive windows
//! - [`transport`]: the session shared by a connection's reader and writer
//! - [`connection`]: handshake, reader and writer threads, teardown
//! - [`push`]: PUSH_PROMISE reservation and pushed-stream handles
//! - [`handler`]: the application side, including a path [`Router`]
//! - [`server`]: the accept loop
//!
//! Each connection runs one reader thread, one writer thread and one thread
//! per inbound message being handled. All shared per-connection state sits
//! behind a single mutex; frames that carry header blocks are encoded and
//! queued while it is held, and written by the writer thread after it is
//! released.
//!
//! # Example
//!
//! ```no_run
//! use h2push::http::h2::{serve, Connection, H2Message, SettingsBuilder};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let handler = |conn: &Arc<Connection>, msg: H2Message| {
//!     if msg.path() == Some("/") {
//!         if let Ok(pushed) = conn.push(msg.stream_id, "GET", "/app.js", &[]) {
//!             pushed.send_response(200, &[("content-type", "text/javascript")], b"run()")?;
//!         }
//!     }
//!     conn.send_response(msg.stream_id, 200, &[("content-type", "text/html")], b"<html/>")
//! };
//!
//! let settings = SettingsBuilder::new().max_concurrent_streams(64).build()?;
//! serve(Arc::new(handler), "127.0.0.1", 8080, None, settings)?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod handler;
pub mod hpack;
pub mod push;
pub mod server;
pub mod settings;
pub mod stream;
pub mod stream_table;
pub mod transport;

pub use self::connection::{Connection, ConnectionConfig, ConnectionConfigBuilder, ConnectionState, Role, TeardownReason};
pub use self::error::{Error, ErrorCode, Result};
pub use self::frames::{Frame, FrameFlags, FrameType};
pub use self::handler::{H2Message, Handler, NotFound, Router};
pub use self::hpack::{HeaderDecoder, HeaderEncoder, HeaderList};
pub use self::push::StreamHandle;
pub use self::server::{serve, Server, ServerConfig, ServerConfigBuilder};
pub use self::settings::{Settings, SettingsBuilder, SettingsParameter};
pub use self::stream::{StreamId, StreamState};

/// Client connection preface (RFC 7540 Section 3.5)
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (RFC 7540 Section 6.9.2)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (RFC 7540 Section 6.5.2)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (RFC 7540 Section 6.5.2)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Largest stream identifier (31 bits)
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_preface() {
        assert_eq!(CONNECTION_PREFACE.len(), 24);
        assert!(CONNECTION_PREFACE.starts_with(b"PRI * HTTP/2.0"));
    }

    #[test]
    fn test_defaults_are_valid_settings() {
        Settings::server_defaults().validate().unwrap();
        assert_eq!(Settings::new().initial_window_size(), DEFAULT_INITIAL_WINDOW_SIZE);
        assert_eq!(Settings::new().max_frame_size(), DEFAULT_MAX_FRAME_SIZE);
    }
}
