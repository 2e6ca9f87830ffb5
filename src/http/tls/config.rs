//! TLS configuration
//!
//! This module provides TLS configuration builders for both sides of an
//! HTTP/2 connection. Builders only record choices; OpenSSL is touched in
//! `build()`, so every failure surfaces there as a `TlsError`.

use super::ALPN_H2;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{AlpnError, SslContext, SslContextBuilder, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Default TLS handshake timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Parse TLS version from string (case-insensitive)
    pub fn parse(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }

    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(self) -> openssl::ssl::SslVersion {
        use openssl::ssl::SslVersion;
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    pub(crate) is_server: bool,
    pub(crate) servername: Option<String>,
    pub(crate) handshake_timeout: Duration,
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Create a new server configuration builder
    pub fn server() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Whether this configuration accepts (server) or connects (client)
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Connect to a server with TLS (client-side)
    pub fn connect(&self, stream: std::net::TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use server config for client connection".to_string(),
            ));
        }
        super::session::TlsSessionOps::connect(stream, self)
    }

    /// Accept a client connection with TLS (server-side)
    pub fn accept(&self, stream: std::net::TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if !self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use client config for server accept".to_string(),
            ));
        }
        super::session::TlsSessionOps::accept(stream, self)
    }
}

/// Encode protocol names in ALPN wire format (length-prefixed)
fn encode_alpn(protocols: &[String]) -> Result<Vec<u8>, TlsError> {
    let mut wire = Vec::new();
    for proto in protocols {
        let len = u8::try_from(proto.len())
            .ok()
            .filter(|len| *len > 0)
            .ok_or_else(|| TlsError::InvalidConfig(format!("Invalid ALPN protocol: {:?}", proto)))?;
        wire.push(len);
        wire.extend_from_slice(proto.as_bytes());
    }
    Ok(wire)
}

/// Length-prefixed entries of an ALPN protocol list
fn alpn_entries<'a>(mut wire: &'a [u8]) -> impl Iterator<Item = &'a [u8]> {
    std::iter::from_fn(move || {
        let (&len, rest) = wire.split_first()?;
        if rest.len() < len as usize {
            return None;
        }
        let (proto, rest) = rest.split_at(len as usize);
        wire = rest;
        Some(proto)
    })
}

/// First of our protocols, in our order, that the client also offered
///
/// The result borrows from the client's list, which outlives the callback.
fn select_alpn<'a>(server: &[u8], client: &'a [u8]) -> Option<&'a [u8]> {
    alpn_entries(server).find_map(|ours| alpn_entries(client).find(|theirs| *theirs == ours))
}

fn apply_versions(
    ctx: &mut SslContextBuilder,
    min: Option<TlsVersion>,
    max: Option<TlsVersion>,
) -> Result<(), TlsError> {
    if let (Some(min), Some(max)) = (min, max) {
        if min > max {
            return Err(TlsError::InvalidConfig(format!(
                "Minimum version {} is above maximum {}",
                min.as_str(),
                max.as_str()
            )));
        }
    }
    ctx.set_min_proto_version(min.map(TlsVersion::to_openssl_version))?;
    ctx.set_max_proto_version(max.map(TlsVersion::to_openssl_version))?;
    Ok(())
}

/// Client configuration builder
pub struct ClientConfigBuilder {
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    alpn: Vec<String>,
    servername: Option<String>,
    verify_peer: bool,
    handshake_timeout: Duration,
}

impl ClientConfigBuilder {
    fn new() -> Self {
        ClientConfigBuilder {
            min_version: None,
            max_version: None,
            alpn: vec![ALPN_H2.to_string()],
            servername: None,
            // Default: don't verify peer (self-signed test identities)
            verify_peer: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Set TLS version (both min and max)
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.min_version = Some(min);
        self.max_version = Some(max);
        self
    }

    /// Set ALPN protocols offered to the server
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        self.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Set SNI servername
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Enable/disable peer certificate verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Set the handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_client())?;
        apply_versions(&mut ctx, self.min_version, self.max_version)?;

        ctx.set_verify(if self.verify_peer {
            SslVerifyMode::PEER
        } else {
            SslVerifyMode::NONE
        });

        if !self.alpn.is_empty() {
            ctx.set_alpn_protos(&encode_alpn(&self.alpn)?)?;
        }

        Ok(TlsConfig {
            ctx: ctx.build(),
            is_server: false,
            servername: self.servername,
            handshake_timeout: self.handshake_timeout,
        })
    }
}

/// Where the server identity comes from
enum Identity {
    /// The built-in self-signed certificate
    Builtin,
    /// A PEM file holding certificate and private key
    File(PathBuf),
    /// Separate certificate and key PEM blobs
    Pem { cert: Vec<u8>, key: Vec<u8> },
}

impl Identity {
    fn load(&self) -> Result<(X509, PKey<Private>), TlsError> {
        let (cert_pem, key_pem) = match self {
            Identity::Builtin => {
                let pem = super::builtin_cert::BUILTIN_CERT.as_bytes().to_vec();
                (pem.clone(), pem)
            }
            Identity::File(path) => {
                let pem = fs::read(path)?;
                (pem.clone(), pem)
            }
            Identity::Pem { cert, key } => (cert.clone(), key.clone()),
        };

        let cert = X509::from_pem(&cert_pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
        let key = PKey::private_key_from_pem(&key_pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;

        Ok((cert, key))
    }
}

/// Server configuration builder
pub struct ServerConfigBuilder {
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    alpn: Vec<String>,
    identity: Identity,
    handshake_timeout: Duration,
}

impl ServerConfigBuilder {
    fn new() -> Self {
        ServerConfigBuilder {
            min_version: Some(TlsVersion::Tls12),
            max_version: None,
            alpn: vec![ALPN_H2.to_string()],
            identity: Identity::Builtin,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Set TLS version (both min and max)
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.min_version = Some(min);
        self.max_version = Some(max);
        self
    }

    /// Set ALPN protocols the server is willing to select
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        self.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Load certificate and private key from one PEM file
    pub fn cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity = Identity::File(path.into());
        self
    }

    /// Use a certificate and private key given as PEM
    pub fn identity_pem(mut self, cert: &[u8], key: &[u8]) -> Self {
        self.identity = Identity::Pem {
            cert: cert.to_vec(),
            key: key.to_vec(),
        };
        self
    }

    /// Set the handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_server())?;
        apply_versions(&mut ctx, self.min_version, self.max_version)?;

        let (cert, key) = self.identity.load()?;
        ctx.set_certificate(&cert)?;
        ctx.set_private_key(&key)?;
        ctx.check_private_key()
            .map_err(|e| TlsError::Certificate(format!("Private key does not match certificate: {}", e)))?;

        if !self.alpn.is_empty() {
            let server_protos = encode_alpn(&self.alpn)?;
            ctx.set_alpn_select_callback(move |_ssl, client_protos| {
                select_alpn(&server_protos, client_protos).ok_or(AlpnError::NOACK)
            });
        }

        Ok(TlsConfig {
            ctx: ctx.build(),
            is_server: true,
            servername: None,
            handshake_timeout: self.handshake_timeout,
        })
    }
}
