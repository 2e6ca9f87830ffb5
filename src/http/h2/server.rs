//! HTTP/2 connection acceptor
//!
//! [`Server`] owns the listening socket and hands every accepted connection
//! to its own thread, which runs the TLS handshake (when configured), the
//! HTTP/2 preface exchange and then waits for the connection to close. A
//! failing connection is logged and forgotten; only a listener error stops
//! the accept loop.
//!
//! # Example
//!
//! ```no_run
//! use h2push::http::h2::{H2Message, Connection, Router, Server, ServerConfig};
//! use h2push::http::tls::TlsConfig;
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let router = Router::new().route("/", |conn: &Arc<Connection>, msg: H2Message| {
//!     conn.push(msg.stream_id, "GET", "/style.css", &[])?
//!         .send_response(200, &[("content-type", "text/css")], b"body {}")?;
//!     conn.send_response(msg.stream_id, 200, &[("content-type", "text/html")], b"<html/>")
//! });
//!
//! let config = ServerConfig::builder()
//!     .host("0.0.0.0")
//!     .port(8443)
//!     .tls(TlsConfig::server().build()?)
//!     .build()?;
//! Server::bind(config, Arc::new(router))?.run()?;
//! # Ok(())
//! # }
//! ```

use super::connection::{Connection, ConnectionConfig, ConnectionConfigBuilder, Role};
use super::error::{Error, Result};
use super::handler::Handler;
use super::settings::Settings;
use crate::http::session::{FdSessionOps, SessionOps};
use crate::http::tls::{TlsConfig, ALPN_H2};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const DEFAULT_BACKLOG: i32 = 128;

/// Pause after an accept failed for lack of descriptors or memory
const RESOURCE_BACKOFF: Duration = Duration::from_millis(100);

/// Acceptor configuration
#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks an ephemeral port
    pub port: u16,
    pub tls: Option<TlsConfig>,
    pub connection: ConnectionConfig,
    /// `:authority` for pushes; defaults to host:port of the bound socket
    pub authority: Option<String>,
    pub backlog: i32,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .field("connection", &self.connection)
            .field("authority", &self.authority)
            .field("backlog", &self.backlog)
            .finish()
    }
}

/// Builder for [`ServerConfig`]
pub struct ServerConfigBuilder {
    host: String,
    port: u16,
    tls: Option<TlsConfig>,
    connection: ConnectionConfig,
    authority: Option<String>,
    backlog: i32,
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        ServerConfigBuilder {
            host: "127.0.0.1".to_string(),
            port: 0,
            tls: None,
            connection: ConnectionConfig::default(),
            authority: None,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl ServerConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Serve over TLS; the config must be a server config offering `h2`
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Local SETTINGS announced to every client
    pub fn settings(mut self, settings: Settings) -> Self {
        self.connection.settings = settings;
        self
    }

    pub fn authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.connection.handshake_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection.write_timeout = timeout;
        self
    }

    pub fn escalate_push_failures(mut self, escalate: bool) -> Self {
        self.connection.escalate_push_failures = escalate;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn build(self) -> Result<ServerConfig> {
        if self.host.is_empty() {
            return Err(Error::InvalidSettings("host must not be empty".to_string()));
        }
        if self.backlog <= 0 {
            return Err(Error::InvalidSettings(format!("backlog {} must be positive", self.backlog)));
        }
        if let Some(tls) = &self.tls {
            if !tls.is_server() {
                return Err(Error::InvalidSettings("TLS config is not a server config".to_string()));
            }
        }

        let connection = ConnectionConfigBuilder::from_config(self.connection).build()?;
        Ok(ServerConfig {
            host: self.host,
            port: self.port,
            tls: self.tls,
            connection,
            authority: self.authority,
            backlog: self.backlog,
        })
    }
}

/// Accept loop
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    shutdown: AtomicBool,
}

impl Server {
    /// Bind the listening socket
    pub fn bind(mut config: ServerConfig, handler: Arc<dyn Handler>) -> Result<Server> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::InvalidSettings(format!("cannot resolve {}", config.host)))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(config.backlog)?;
        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr()?;

        config.connection.authority = match config.authority.take() {
            Some(authority) => authority,
            None => format!("{}:{}", config.host, local_addr.port()),
        };
        info!(addr = %local_addr, tls = config.tls.is_some(), "listening");

        Ok(Server {
            listener,
            local_addr,
            config,
            handler,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until [`shutdown`](Self::shutdown) or a listener error
    pub fn run(&self) -> Result<()> {
        loop {
            let accepted = self.listener.accept();
            if self.shutdown.load(Ordering::Acquire) {
                debug!(addr = %self.local_addr, "accept loop stopped");
                return Ok(());
            }

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => match accept_backoff(&e) {
                    Some(pause) if pause.is_zero() => {
                        debug!(error = %e, "accept failed");
                        continue;
                    }
                    Some(pause) => {
                        warn!(error = %e, ?pause, "accept failed, backing off");
                        thread::sleep(pause);
                        continue;
                    }
                    None => {
                        error!(addr = %self.local_addr, error = %e, "listener failed");
                        return Err(e.into());
                    }
                },
            };

            let tls = self.config.tls.clone();
            let config = self.config.connection.clone();
            let handler = Arc::clone(&self.handler);
            let spawned = thread::Builder::new()
                .name(format!("h2-conn-{}", peer))
                .spawn(move || {
                    if let Err(e) = serve_connection(stream, tls, config, handler) {
                        if e.is_benign_disconnect() {
                            debug!(%peer, error = %e, "connection ended");
                        } else {
                            warn!(%peer, error = %e, "connection failed");
                        }
                    }
                });
            if let Err(e) = spawned {
                warn!(%peer, error = %e, "cannot spawn connection thread");
            }
        }
    }

    /// Stop a running accept loop from another thread
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wake the blocked accept()
        let mut wake = self.local_addr;
        if wake.ip().is_unspecified() {
            wake.set_ip(match wake.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        let _ = TcpStream::connect_timeout(&wake, Duration::from_secs(1));
    }
}

/// How long to wait before retrying a failed accept; `None` when the
/// listener itself is broken
///
/// Running out of descriptors leaves the pending connection in the backlog,
/// so retrying at once would fail again immediately.
fn accept_backoff(e: &io::Error) -> Option<Duration> {
    if matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    ) {
        return Some(RESOURCE_BACKOFF);
    }
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => Some(Duration::ZERO),
        _ => None,
    }
}

/// Run one accepted connection to completion
fn serve_connection(
    stream: TcpStream,
    tls: Option<TlsConfig>,
    config: ConnectionConfig,
    handler: Arc<dyn Handler>,
) -> Result<()> {
    stream.set_nodelay(true)?;

    let session: Box<dyn SessionOps> = match tls {
        Some(tls) => {
            let session = tls.accept(stream).map_err(|e| Error::Handshake(e.to_string()))?;
            let negotiated = session.alpn_protocol();
            if negotiated.as_deref() != Some(ALPN_H2.as_bytes()) {
                return Err(Error::Handshake(Error::AlpnFailed(negotiated).to_string()));
            }
            Box::new(session)
        }
        None => Box::new(FdSessionOps::new(stream)),
    };

    let conn = Connection::establish(session, Role::Responder, config, handler)?;
    conn.run_until_closed();
    Ok(())
}

/// Bind and run an acceptor in one call; blocks until the listener fails
pub fn serve(
    handler: Arc<dyn Handler>,
    host: &str,
    port: u16,
    tls: Option<TlsConfig>,
    settings: Settings,
) -> Result<()> {
    let mut builder = ServerConfig::builder().host(host).port(port).settings(settings);
    if let Some(tls) = tls {
        builder = builder.tls(tls);
    }
    Server::bind(builder.build()?, handler)?.run()
}
