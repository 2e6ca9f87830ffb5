//! Application handlers
//!
//! A [`Handler`] receives every fully-received message on a connection: a
//! request on the server side, a response or a pushed response on the client
//! side. It runs on a thread of its own and may push, respond or reset
//! through the [`Connection`] it is given.

use super::connection::Connection;
use super::error::Result;
use super::hpack::HeaderList;
use super::stream::StreamId;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// A complete inbound message
#[derive(Debug, Clone)]
pub struct H2Message {
    pub stream_id: StreamId,
    pub headers: HeaderList,
    pub body: Bytes,
    /// Stream the message was promised on, for pushed responses
    pub origin: Option<StreamId>,
    /// Request headers from the PUSH_PROMISE, for pushed responses
    pub promise: Option<HeaderList>,
}

impl H2Message {
    pub fn method(&self) -> Option<&str> {
        self.headers.get(":method")
    }

    pub fn path(&self) -> Option<&str> {
        self.headers.get(":path")
    }

    pub fn scheme(&self) -> Option<&str> {
        self.headers.get(":scheme")
    }

    pub fn authority(&self) -> Option<&str> {
        self.headers.get(":authority")
    }

    /// Response status, when the message is a response
    pub fn status(&self) -> Option<u16> {
        self.headers.get(":status").and_then(|s| s.parse().ok())
    }

    pub fn is_push(&self) -> bool {
        self.origin.is_some()
    }
}

/// Something that handles complete messages
///
/// An error or a panic resets the message's stream with INTERNAL_ERROR.
pub trait Handler: Send + Sync {
    fn handle(&self, conn: &Arc<Connection>, msg: H2Message) -> Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&Arc<Connection>, H2Message) -> Result<()> + Send + Sync,
{
    fn handle(&self, conn: &Arc<Connection>, msg: H2Message) -> Result<()> {
        self(conn, msg)
    }
}

/// Answers every request with 404
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFound;

impl Handler for NotFound {
    fn handle(&self, conn: &Arc<Connection>, msg: H2Message) -> Result<()> {
        conn.send_response(msg.stream_id, 404, &[("content-type", "text/plain")], b"Not Found")
    }
}

/// Dispatch on the exact request path, ignoring the query string
pub struct Router {
    routes: HashMap<String, Arc<dyn Handler>>,
    fallback: Arc<dyn Handler>,
}

impl Router {
    pub fn new() -> Self {
        Router {
            routes: HashMap::new(),
            fallback: Arc::new(NotFound),
        }
    }

    pub fn route(mut self, path: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.routes.insert(path.into(), Arc::new(handler));
        self
    }

    /// Handler for unrouted paths; [`NotFound`] unless replaced
    pub fn fallback(mut self, handler: impl Handler + 'static) -> Self {
        self.fallback = Arc::new(handler);
        self
    }

    fn select(&self, path: &str) -> &Arc<dyn Handler> {
        let path = path.split('?').next().unwrap_or(path);
        self.routes.get(path).unwrap_or(&self.fallback)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for Router {
    fn handle(&self, conn: &Arc<Connection>, msg: H2Message) -> Result<()> {
        let handler = Arc::clone(self.select(msg.path().unwrap_or("/")));
        handler.handle(conn, msg)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut paths: Vec<&String> = self.routes.keys().collect();
        paths.sort();
        f.debug_struct("Router").field("routes", &paths).finish()
    }
}
