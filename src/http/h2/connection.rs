//! HTTP/2 connection lifecycle
//!
//! A [`Connection`] owns one transport from preface exchange to teardown.
//!
//! # Threads
//!
//! [`Connection::establish`] starts two threads per connection:
//!
//! - the writer drains the outbound queue onto the transport, in queue order
//! - the reader performs the handshake, then parses and dispatches frames
//!
//! Completed inbound messages are handed to the [`Handler`] on a thread of
//! their own, so a slow or panicking handler only affects its stream.
//!
//! # Locking
//!
//! All shared bookkeeping (settings, stream table, header encoder, flow
//! windows, the queue sender) sits in one mutex. Header-bearing frames are
//! encoded *and* queued while that mutex is held, which makes queue order
//! (and therefore wire order) equal to encoder order. Nothing blocks on the
//! network with the mutex held: queueing is an in-memory channel send, and
//! callers that want to know a frame hit the wire wait for the writer's
//! acknowledgement after unlocking.

use super::codec;
use super::error::{Error, ErrorCode, Result};
use super::flow_control::FlowControl;
use super::frames::*;
use super::handler::{H2Message, Handler};
use super::hpack::{HeaderDecoder, HeaderEncoder, HeaderList};
use super::settings::Settings;
use super::stream::{Stream, StreamEvent, StreamId, StreamState};
use super::stream_table::StreamTable;
use super::transport::Transport;
use super::{CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE};
use crate::http::session::SessionOps;
use bytes::{Bytes, BytesMut};
use std::io::Read;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which end of the connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client: opens odd-numbered streams
    Initiator,
    /// Server: opens even-numbered (pushed) streams
    Responder,
}

impl Role {
    pub fn first_local_id(self) -> StreamId {
        match self {
            Role::Initiator => 1,
            Role::Responder => 2,
        }
    }

    /// Whether `id` has this side's parity
    pub fn is_local(self, id: StreamId) -> bool {
        match self {
            Role::Initiator => id % 2 == 1,
            Role::Responder => id != 0 && id % 2 == 0,
        }
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Open,
    /// Peer sent GOAWAY: no new streams in either direction
    GoingAway,
    Closed,
}

/// Why a connection is being torn down
#[derive(Debug)]
pub enum TeardownReason {
    /// Peer hung up (EOF or an ordinary disconnect error)
    PeerClosed,
    /// Closed from this side
    LocalClose,
    Error(Error),
}

/// Per-connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub settings: Settings,
    /// Host identity used as `:authority` for pushes and requests
    pub authority: String,
    pub handshake_timeout: Duration,
    pub write_timeout: Option<Duration>,
    /// How long teardown waits for queued frames (GOAWAY) to drain
    pub linger: Duration,
    pub escalate_push_failures: bool,
    pub read_poll_interval: Duration,
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            settings: Settings::server_defaults(),
            authority: "localhost".to_string(),
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Some(Duration::from_secs(30)),
            linger: Duration::from_secs(1),
            escalate_push_failures: false,
            read_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Builder for [`ConnectionConfig`]
#[derive(Debug, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Start from an existing config, to adjust and revalidate it
    pub fn from_config(config: ConnectionConfig) -> Self {
        ConnectionConfigBuilder { config }
    }

    /// Local settings announced in our SETTINGS frame
    pub fn settings(mut self, settings: Settings) -> Self {
        self.config.settings = settings;
        self
    }

    pub fn authority(mut self, authority: impl Into<String>) -> Self {
        self.config.authority = authority.into();
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// `None` lets a peer that never reads stall the writer forever
    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn linger(mut self, linger: Duration) -> Self {
        self.config.linger = linger;
        self
    }

    /// Tear the connection down when a push announcement cannot be written
    pub fn escalate_push_failures(mut self, escalate: bool) -> Self {
        self.config.escalate_push_failures = escalate;
        self
    }

    pub fn read_poll_interval(mut self, interval: Duration) -> Self {
        self.config.read_poll_interval = interval;
        self
    }

    pub fn build(self) -> Result<ConnectionConfig> {
        self.config.settings.validate()?;
        if self.config.read_poll_interval.is_zero() {
            return Err(Error::InvalidSettings("read poll interval must be non-zero".to_string()));
        }
        Ok(self.config)
    }
}

/// Serialized bytes on their way to the writer
pub(crate) struct Outbound {
    pub bytes: Bytes,
    /// Told whether the write succeeded
    pub ack: Option<SyncSender<std::result::Result<(), String>>>,
}

/// Writer's verdict on one acknowledged write
pub(crate) type WriteAck = Receiver<std::result::Result<(), String>>;

/// State shared by the reader, the writer and application threads
///
/// Only reachable through the connection's mutex, from this module.
struct Core {
    state: ConnectionState,
    remote: Settings,
    streams: StreamTable,
    encoder: HeaderEncoder,
    flow: FlowControl,
    /// Taken at teardown; `None` means nothing more can be queued
    outbound: Option<Sender<Outbound>>,
    writer_done: bool,
}

impl Core {
    fn enqueue(&self, bytes: Bytes) -> Result<()> {
        let tx = self.outbound.as_ref().ok_or(Error::ConnectionClosed)?;
        tx.send(Outbound { bytes, ack: None }).map_err(|_| Error::ConnectionClosed)
    }

    fn enqueue_frame(&self, frame: &Frame) -> Result<()> {
        trace!(frame = %frame, "queue");
        self.enqueue(codec::serialize(frame))
    }

    /// Queue bytes and get a receiver for the writer's verdict
    fn enqueue_acked(&self, bytes: Bytes) -> Result<WriteAck> {
        let tx = self.outbound.as_ref().ok_or(Error::ConnectionClosed)?;
        let (ack, verdict) = mpsc::sync_channel(1);
        tx.send(Outbound { bytes, ack: Some(ack) }).map_err(|_| Error::ConnectionClosed)?;
        Ok(verdict)
    }

    /// Drop a stream once it reached Closed
    fn retire(&mut self, id: StreamId) {
        if self.streams.lookup(id).map_or(false, |s| s.state().is_closed()) {
            self.streams.remove(id);
        }
    }

    /// Take in SETTINGS from the peer
    fn merge_remote(&mut self, settings: &Settings) {
        self.remote.merge(settings);
        if let Some(size) = settings.header_table_size {
            self.encoder.set_peer_table_size(size);
        }
    }
}

/// Largest header block buffered across CONTINUATION frames when we
/// announce no SETTINGS_MAX_HEADER_LIST_SIZE
const MAX_HEADER_BLOCK_SIZE: usize = 1 << 20;

/// Header block being reassembled from HEADERS/PUSH_PROMISE + CONTINUATION
enum PendingBlock {
    Headers { stream_id: StreamId, end_stream: bool, block: BytesMut },
    PushPromise { stream_id: StreamId, promised: StreamId, block: BytesMut },
}

impl PendingBlock {
    fn stream_id(&self) -> StreamId {
        match self {
            PendingBlock::Headers { stream_id, .. } | PendingBlock::PushPromise { stream_id, .. } => *stream_id,
        }
    }

    /// Append a fragment, refusing to buffer more than `limit` octets
    fn append(&mut self, fragment: &[u8], limit: usize) -> Result<()> {
        let stream_id = self.stream_id();
        let block = match self {
            PendingBlock::Headers { block, .. } | PendingBlock::PushPromise { block, .. } => block,
        };
        if block.len() + fragment.len() > limit {
            return Err(Error::HeaderBlockTooLarge { stream_id, limit });
        }
        block.extend_from_slice(fragment);
        Ok(())
    }
}

/// State owned by the reader thread alone
struct ReaderState {
    decoder: HeaderDecoder,
    pending: Option<PendingBlock>,
    block_limit: usize,
}

impl ReaderState {
    fn new(settings: &Settings) -> Self {
        let list_limit = settings.max_header_list_size();
        ReaderState {
            decoder: HeaderDecoder::new().with_max_list_size(list_limit),
            pending: None,
            block_limit: list_limit.map_or(MAX_HEADER_BLOCK_SIZE, |n| (n as usize).min(MAX_HEADER_BLOCK_SIZE)),
        }
    }

    /// Start reassembling a header block from its first fragment
    fn begin(&mut self, mut pending: PendingBlock, fragment: &[u8]) -> Result<()> {
        pending.append(fragment, self.block_limit)?;
        self.pending = Some(pending);
        Ok(())
    }
}

/// One HTTP/2 connection
pub struct Connection {
    id: u64,
    role: Role,
    config: ConnectionConfig,
    secure: bool,
    peer: Option<SocketAddr>,
    transport: Option<Arc<Transport>>,
    handler: Option<Arc<dyn Handler>>,
    core: Mutex<Core>,
    /// Signalled on teardown, writer exit and flow-control window changes
    changed: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .finish()
    }
}

impl Connection {
    fn new(
        role: Role,
        config: ConnectionConfig,
        transport: Option<Arc<Transport>>,
        handler: Option<Arc<dyn Handler>>,
        outbound: Sender<Outbound>,
    ) -> Self {
        let secure = transport.as_ref().map_or(false, |t| t.is_secure());
        let peer = transport.as_ref().and_then(|t| t.peer_addr());

        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            role,
            secure,
            peer,
            core: Mutex::new(Core {
                state: ConnectionState::Handshaking,
                remote: Settings::new(),
                streams: StreamTable::new(role),
                encoder: HeaderEncoder::new(),
                flow: FlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE),
                outbound: Some(outbound),
                writer_done: false,
            }),
            config,
            transport,
            handler,
            changed: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Start the reader and writer threads and run the preface exchange
    ///
    /// A responder waits for the client preface and its first SETTINGS
    /// before sending anything. Returns once the connection is open; on
    /// failure the connection is already torn down.
    pub fn establish(
        session: Box<dyn SessionOps>,
        role: Role,
        config: ConnectionConfig,
        handler: Arc<dyn Handler>,
    ) -> Result<Arc<Connection>> {
        let transport = Arc::new(
            Transport::new(session, config.read_poll_interval, config.write_timeout)
                .map_err(|e| Error::Handshake(e.to_string()))?,
        );

        let handshake_timeout = config.handshake_timeout;
        let (tx, rx) = mpsc::channel();
        let conn = Arc::new(Connection::new(role, config, Some(Arc::clone(&transport)), Some(handler), tx));
        debug!(conn = conn.id, peer = ?conn.peer, ?role, secure = conn.secure, "establishing connection");

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let writer = {
            let transport = Arc::clone(&transport);
            let weak = Arc::downgrade(&conn);
            thread::Builder::new()
                .name(format!("h2-writer-{}", conn.id))
                .spawn(move || writer_loop(transport, rx, weak))?
        };
        let reader = {
            let conn = Arc::clone(&conn);
            thread::Builder::new()
                .name(format!("h2-reader-{}", conn.id))
                .spawn(move || conn.reader_loop(transport, ready_tx))
        };
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                conn.teardown(TeardownReason::LocalClose);
                conn.threads().push(writer);
                conn.run_until_closed();
                return Err(Error::Io(e));
            }
        };
        conn.threads().extend([writer, reader]);

        let outcome = match ready_rx.recv_timeout(handshake_timeout) {
            Ok(Ok(())) => return Ok(conn),
            Ok(Err(e)) => e,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let reason = format!("no preface within {:?}", handshake_timeout);
                conn.teardown(TeardownReason::Error(Error::Handshake(reason.clone())));
                Error::Handshake(reason)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Error::Handshake("reader exited".to_string()),
        };

        conn.run_until_closed();
        Err(outcome)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the transport is TLS-wrapped
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Our `:authority`
    pub fn authority(&self) -> &str {
        &self.config.authority
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn local_settings(&self) -> &Settings {
        &self.config.settings
    }

    /// Snapshot of the peer's settings
    pub fn remote_settings(&self) -> Settings {
        self.lock_core().remote.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_core().state
    }

    pub fn stream_count(&self) -> usize {
        self.lock_core().streams.len()
    }

    /// State of a stream still in the table
    pub fn stream_state(&self, id: StreamId) -> Option<StreamState> {
        self.lock_core().streams.lookup(id).map(|s| s.state())
    }

    /// Next id this side would allocate
    pub fn next_stream_id(&self) -> StreamId {
        self.lock_core().streams.next_local_id()
    }

    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `:scheme` for this connection's own requests and pushes
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// Open a request stream (initiator only)
    ///
    /// The response is delivered to the connection's handler.
    pub fn send_request(&self, method: &str, path: &str, headers: &[(&str, &str)], body: &[u8]) -> Result<StreamId> {
        if self.role != Role::Initiator {
            return Err(Error::Protocol("only the initiator opens request streams".to_string()));
        }

        let id = {
            let mut guard = self.lock_core();
            if guard.state != ConnectionState::Open {
                return Err(Error::ConnectionClosed);
            }
            let core = &mut *guard;
            let limit = core.remote.max_concurrent_streams();
            let stream = core.streams.try_reserve(
                limit,
                core.remote.initial_window_size(),
                self.config.settings.initial_window_size(),
            )?;
            let id = stream.id();
            stream.apply(StreamEvent::SendHeaders { end_stream: body.is_empty() })?;

            let mut list = HeaderList::request(method, self.scheme(), &self.config.authority, path);
            list.extend_regular(headers);
            let block = core.encoder.encode(&list)?;
            core.enqueue(codec::serialize_headers(id, &block, body.is_empty(), core.remote.max_frame_size()))?;
            debug!(conn = self.id, stream = id, method, path, "request sent");
            id
        };

        if !body.is_empty() {
            self.send_data(id, body, true)?;
        }
        Ok(id)
    }

    /// Send a complete response: HEADERS, then DATA when there is a body
    pub fn send_response(&self, stream_id: StreamId, status: u16, headers: &[(&str, &str)], body: &[u8]) -> Result<()> {
        let mut list = HeaderList::response(status);
        list.extend_regular(headers);
        self.send_headers(stream_id, &list, body.is_empty())?;
        if !body.is_empty() {
            self.send_data(stream_id, body, true)?;
        }
        Ok(())
    }

    /// Encode and queue a header block on an existing stream
    pub fn send_headers(&self, stream_id: StreamId, headers: &HeaderList, end_stream: bool) -> Result<()> {
        let result = {
            let mut guard = self.lock_core();
            let core = &mut *guard;
            if core.outbound.is_none() {
                return Err(Error::ConnectionClosed);
            }
            let stream = core.streams.lookup_mut(stream_id).ok_or(Error::StreamNotFound(stream_id))?;
            match stream.apply(StreamEvent::SendHeaders { end_stream }) {
                Ok(_) => {
                    let block = core.encoder.encode(headers)?;
                    let bytes = codec::serialize_headers(stream_id, &block, end_stream, core.remote.max_frame_size());
                    trace!(conn = self.id, stream = stream_id, end_stream, "queue HEADERS");
                    core.retire(stream_id);
                    core.enqueue(bytes)
                }
                Err(e) => Err(e),
            }
        };
        self.fail_on_illegal(result)
    }

    /// Queue DATA, split by the peer's frame size and flow-control windows
    ///
    /// Blocks while the peer's windows are exhausted.
    pub fn send_data(&self, stream_id: StreamId, data: &[u8], end_stream: bool) -> Result<()> {
        if data.is_empty() && !end_stream {
            return Ok(());
        }

        let mut remaining = data;
        loop {
            let mut guard = self.lock_core();
            let capacity = loop {
                if guard.outbound.is_none() {
                    return Err(Error::ConnectionClosed);
                }
                let max_frame = guard.remote.max_frame_size() as usize;
                let conn_window = guard.flow.send.available();
                let stream = guard.streams.lookup(stream_id).ok_or(Error::StreamClosed(stream_id))?;
                let capacity = max_frame.min(conn_window).min(stream.flow.send.available());
                if capacity > 0 || remaining.is_empty() {
                    break capacity;
                }
                guard = self.changed.wait(guard).unwrap_or_else(PoisonError::into_inner);
            };

            let n = capacity.min(remaining.len());
            let fin = end_stream && n == remaining.len();
            let core = &mut *guard;
            let stream = core.streams.lookup_mut(stream_id).ok_or(Error::StreamClosed(stream_id))?;
            if let Err(e) = stream.apply(StreamEvent::SendData { end_stream: fin }) {
                drop(guard);
                return self.fail_on_illegal(Err(e));
            }
            stream.flow.send.consume(n);
            core.flow.send.consume(n);

            let (chunk, rest) = remaining.split_at(n);
            core.enqueue_frame(&Frame::Data(DataFrame::new(stream_id, Bytes::copy_from_slice(chunk), fin)))?;
            core.retire(stream_id);
            remaining = rest;

            if remaining.is_empty() {
                return Ok(());
            }
        }
    }

    /// Reset a stream from our side
    pub fn send_reset(&self, stream_id: StreamId, code: ErrorCode) -> Result<()> {
        let mut guard = self.lock_core();
        let core = &mut *guard;
        if let Some(stream) = core.streams.lookup_mut(stream_id) {
            stream.apply(StreamEvent::SendReset)?;
            core.streams.remove(stream_id);
        }
        debug!(conn = self.id, stream = stream_id, code = %code, "reset stream");
        core.enqueue_frame(&Frame::RstStream(RstStreamFrame::new(stream_id, code)))?;
        self.changed.notify_all();
        Ok(())
    }

    /// Reserve the next local stream for a push on `origin` and queue its
    /// PUSH_PROMISE, all in one critical section
    ///
    /// Every rejection is decided before the stream table or the header
    /// encoder is touched. The second value is the writer's verdict, or the
    /// reason the frame could not be queued.
    pub(crate) fn reserve_push(&self, origin: StreamId, request: &HeaderList) -> Result<(StreamId, Result<WriteAck>)> {
        let mut guard = self.lock_core();
        let core = &mut *guard;

        if core.state != ConnectionState::Open {
            return Err(Error::PushDisabled("connection is not open"));
        }
        if !core.remote.enable_push() {
            return Err(Error::PushDisabled("peer disabled server push"));
        }
        match core.streams.lookup(origin) {
            None => return Err(Error::StreamNotFound(origin)),
            Some(stream) if stream.origin().is_some() => {
                return Err(Error::PushDisabled("cannot push on a pushed stream"))
            }
            Some(stream) if !matches!(stream.state(), StreamState::Open | StreamState::HalfClosedRemote) => {
                return Err(Error::PushDisabled("origin stream is not open"))
            }
            Some(_) => {}
        }

        let limit = core.remote.max_concurrent_streams();
        let send_window = core.remote.initial_window_size();
        let stream = core
            .streams
            .try_reserve(limit, send_window, self.config.settings.initial_window_size())?;
        let promised = stream.id();
        stream.apply(StreamEvent::SendPushPromise)?;
        stream.set_origin(origin);

        let block = core.encoder.encode(request)?;
        let bytes = codec::serialize_push_promise(origin, promised, &block, core.remote.max_frame_size());
        Ok((promised, core.enqueue_acked(bytes)))
    }

    /// Illegal transitions are connection-fatal wherever they come from
    fn fail_on_illegal<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e @ Error::IllegalStreamTransition { .. }) = &result {
            self.teardown(TeardownReason::Error(Error::Protocol(e.to_string())));
        }
        result
    }

    /// Close the connection from this side with a GOAWAY(NO_ERROR)
    pub fn close(&self) {
        self.teardown(TeardownReason::LocalClose);
    }

    /// Tear the connection down; every call after the first is a no-op
    ///
    /// Fatal errors and local closes queue a GOAWAY and let the writer drain
    /// it before it closes the transport. Otherwise the transport is closed
    /// right away.
    pub fn teardown(&self, reason: TeardownReason) {
        let mut core = self.lock_core();
        if core.state == ConnectionState::Closed {
            return;
        }
        let was_open = core.state != ConnectionState::Handshaking;
        core.state = ConnectionState::Closed;
        let sender = core.outbound.take();
        let last_peer_id = core.streams.last_peer_id();
        let dropped = core.streams.clear();

        let goaway = match &reason {
            TeardownReason::PeerClosed => {
                debug!(conn = self.id, streams = dropped.len(), "peer closed connection");
                None
            }
            TeardownReason::LocalClose => {
                debug!(conn = self.id, streams = dropped.len(), "closing connection");
                Some((ErrorCode::NoError, String::new()))
            }
            TeardownReason::Error(e) if e.is_benign_disconnect() => {
                debug!(conn = self.id, error = %e, "connection dropped");
                None
            }
            TeardownReason::Error(e) => {
                warn!(conn = self.id, peer = ?self.peer, error = %e, "connection failed");
                e.is_connection_fatal().then(|| (e.error_code(), e.to_string()))
            }
        };

        let drain = match (goaway, &sender) {
            (Some((code, debug_text)), Some(tx)) if was_open => {
                let frame = Frame::Goaway(GoawayFrame::new(last_peer_id, code, Bytes::from(debug_text)));
                tx.send(Outbound {
                    bytes: codec::serialize(&frame),
                    ack: None,
                })
                .is_ok()
            }
            _ => false,
        };
        drop(sender);

        self.changed.notify_all();
        drop(core);

        if !drain {
            if let Some(transport) = &self.transport {
                transport.close();
            }
        }
    }

    /// Block until the connection is closed, then reap its threads
    pub fn run_until_closed(&self) {
        let core = self.lock_core();
        let core = self
            .changed
            .wait_while(core, |c| c.state != ConnectionState::Closed)
            .unwrap_or_else(PoisonError::into_inner);
        let (core, _) = self
            .changed
            .wait_timeout_while(core, self.config.linger, |c| !c.writer_done && self.transport.is_some())
            .unwrap_or_else(PoisonError::into_inner);
        drop(core);

        if let Some(transport) = &self.transport {
            transport.close();
        }

        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.threads().drain(..).collect();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        debug!(conn = self.id, "connection closed");
    }

    fn writer_finished(&self) {
        self.lock_core().writer_done = true;
        self.changed.notify_all();
    }

    fn reader_loop(self: Arc<Self>, transport: Arc<Transport>, ready: SyncSender<Result<()>>) {
        let mut reader = &*transport;
        let mut state = ReaderState::new(&self.config.settings);

        if let Err(e) = self.handshake(&mut reader) {
            let reason = match e {
                Error::Handshake(reason) => reason,
                other => other.to_string(),
            };
            self.teardown(TeardownReason::Error(Error::Handshake(reason.clone())));
            let _ = ready.send(Err(Error::Handshake(reason)));
            return;
        }
        let _ = ready.send(Ok(()));
        drop(ready);

        let error = loop {
            if let Err(e) = self.read_frame(&mut reader).and_then(|frame| self.process(&mut state, frame)) {
                break e;
            }
        };

        let reason = if error.is_benign_disconnect() {
            TeardownReason::PeerClosed
        } else {
            TeardownReason::Error(error)
        };
        self.teardown(reason);
    }

    fn read_frame<R: Read>(&self, reader: &mut R) -> Result<Frame> {
        let (header, payload) = codec::read_frame(reader, self.config.settings.max_frame_size())?;
        let frame = codec::parse(header, payload)?;
        trace!(conn = self.id, frame = %frame, "recv");
        Ok(frame)
    }

    fn handshake<R: Read>(&self, reader: &mut R) -> Result<()> {
        let local = Frame::Settings(SettingsFrame::new(self.config.settings.clone()));

        if self.role == Role::Responder {
            let mut preface = [0u8; 24];
            reader
                .read_exact(&mut preface)
                .map_err(|e| Error::Handshake(format!("reading client preface: {}", e)))?;
            if preface != CONNECTION_PREFACE {
                return Err(Error::Handshake("invalid client preface".to_string()));
            }
        } else {
            let mut bytes = BytesMut::from(CONNECTION_PREFACE);
            codec::serialize_into(&local, &mut bytes);
            self.lock_core().enqueue(bytes.freeze())?;
        }

        let settings = match self.read_frame(reader)? {
            Frame::Settings(f) if !f.ack => f.settings,
            other => return Err(Error::Handshake(format!("expected SETTINGS, got {}", other))),
        };

        let mut core = self.lock_core();
        core.merge_remote(&settings);
        if self.role == Role::Responder {
            core.enqueue_frame(&local)?;
        }
        core.enqueue_frame(&Frame::Settings(SettingsFrame::ack()))?;
        core.state = ConnectionState::Open;
        debug!(conn = self.id, remote = ?core.remote, "connection open");
        Ok(())
    }

    fn process(self: &Arc<Self>, state: &mut ReaderState, frame: Frame) -> Result<()> {
        if let Some(pending) = &state.pending {
            match &frame {
                Frame::Continuation(c) if c.stream_id == pending.stream_id() => {}
                other => {
                    return Err(Error::Protocol(format!(
                        "expected CONTINUATION on stream {}, got {}",
                        pending.stream_id(),
                        other
                    )))
                }
            }
        }

        match frame {
            Frame::Settings(f) => {
                if !f.ack {
                    self.apply_remote_settings(&f.settings)?;
                }
            }
            Frame::Headers(f) => {
                let pending = PendingBlock::Headers {
                    stream_id: f.stream_id,
                    end_stream: f.end_stream,
                    block: BytesMut::new(),
                };
                state.begin(pending, &f.header_block)?;
                if f.end_headers {
                    self.finish_header_block(state)?;
                }
            }
            Frame::PushPromise(f) => {
                if self.role == Role::Responder {
                    return Err(Error::Protocol("client sent PUSH_PROMISE".to_string()));
                }
                if !self.config.settings.enable_push() {
                    return Err(Error::Protocol("PUSH_PROMISE received with push disabled".to_string()));
                }
                let pending = PendingBlock::PushPromise {
                    stream_id: f.stream_id,
                    promised: f.promised_stream_id,
                    block: BytesMut::new(),
                };
                state.begin(pending, &f.header_block)?;
                if f.end_headers {
                    self.finish_header_block(state)?;
                }
            }
            Frame::Continuation(f) => {
                let pending = state
                    .pending
                    .as_mut()
                    .ok_or_else(|| Error::Protocol(format!("unexpected CONTINUATION on stream {}", f.stream_id)))?;
                pending.append(&f.header_block, state.block_limit)?;
                if f.end_headers {
                    self.finish_header_block(state)?;
                }
            }
            Frame::Data(f) => self.on_data(f)?,
            Frame::RstStream(f) => {
                let mut guard = self.lock_core();
                let core = &mut *guard;
                let idle = self.is_idle(core, f.stream_id);
                match core.streams.lookup_mut(f.stream_id) {
                    Some(stream) => {
                        stream.apply(StreamEvent::RecvReset)?;
                        core.streams.remove(f.stream_id);
                        debug!(conn = self.id, stream = f.stream_id, code = %f.error_code, "peer reset stream");
                    }
                    None if idle => {
                        return Err(Error::Protocol(format!("RST_STREAM on idle stream {}", f.stream_id)));
                    }
                    None => {}
                }
                self.changed.notify_all();
            }
            Frame::Ping(f) => {
                if !f.ack {
                    self.lock_core().enqueue_frame(&Frame::Ping(PingFrame::ack(f.data)))?;
                }
            }
            Frame::Goaway(f) => {
                let mut core = self.lock_core();
                if core.state == ConnectionState::Open {
                    core.state = ConnectionState::GoingAway;
                }
                debug!(
                    conn = self.id,
                    last_stream = f.last_stream_id,
                    code = %f.error_code,
                    reason = %String::from_utf8_lossy(&f.debug_data),
                    "peer going away"
                );
            }
            Frame::WindowUpdate(f) => self.on_window_update(f)?,
            Frame::Priority(_) => {}
        }
        Ok(())
    }

    /// Whether `id` was never opened by either side
    fn is_idle(&self, core: &Core, id: StreamId) -> bool {
        if self.role.is_local(id) {
            id >= core.streams.next_local_id()
        } else {
            core.streams.is_new_peer_id(id)
        }
    }

    fn apply_remote_settings(&self, settings: &Settings) -> Result<()> {
        let mut guard = self.lock_core();
        let core = &mut *guard;
        core.merge_remote(settings);
        if let Some(size) = settings.initial_window_size {
            for stream in core.streams.iter_mut() {
                stream.flow.send.update_initial_size(size)?;
            }
        }
        core.enqueue_frame(&Frame::Settings(SettingsFrame::ack()))?;
        debug!(conn = self.id, remote = ?core.remote, "settings applied");
        self.changed.notify_all();
        Ok(())
    }

    fn finish_header_block(self: &Arc<Self>, state: &mut ReaderState) -> Result<()> {
        let pending = match state.pending.take() {
            Some(pending) => pending,
            None => return Ok(()),
        };

        match pending {
            PendingBlock::Headers { stream_id, end_stream, block } => {
                let headers = state.decoder.decode(&block)?;
                self.on_headers(stream_id, end_stream, headers)
            }
            PendingBlock::PushPromise { stream_id, promised, block } => {
                let headers = state.decoder.decode(&block)?;
                self.on_push_promise(stream_id, promised, headers)
            }
        }
    }

    fn on_headers(self: &Arc<Self>, id: StreamId, end_stream: bool, headers: HeaderList) -> Result<()> {
        let mut guard = self.lock_core();
        let core = &mut *guard;

        if core.streams.lookup(id).is_none() {
            if self.role == Role::Initiator && core.streams.is_new_peer_id(id) {
                return Err(Error::Protocol(format!("server opened stream {} without a promise", id)));
            }

            let limit = self.config.settings.max_concurrent_streams();
            let over_limit = limit.map_or(false, |l| core.streams.peer_initiated() >= l as usize);
            if core.streams.is_new_peer_id(id) && (core.state != ConnectionState::Open || over_limit) {
                core.streams.skip_peer_id(id);
                debug!(conn = self.id, stream = id, "refusing stream");
                core.enqueue_frame(&Frame::RstStream(RstStreamFrame::new(id, ErrorCode::RefusedStream)))?;
                return Ok(());
            }

            core.streams.register(Stream::new(
                id,
                core.remote.initial_window_size(),
                self.config.settings.initial_window_size(),
            ))?;
        }

        let stream = core.streams.lookup_mut(id).ok_or(Error::StreamNotFound(id))?;
        stream.apply(StreamEvent::RecvHeaders { end_stream })?;
        stream.add_headers(headers);

        if end_stream {
            let message = Self::complete(core, id);
            drop(guard);
            if let Some(message) = message {
                self.dispatch(message);
            }
        }
        Ok(())
    }

    fn on_push_promise(&self, origin: StreamId, promised: StreamId, headers: HeaderList) -> Result<()> {
        let mut guard = self.lock_core();
        let core = &mut *guard;

        match core.streams.lookup(origin).map(|s| s.state()) {
            Some(StreamState::Open) | Some(StreamState::HalfClosedLocal) => {}
            other => {
                return Err(Error::Protocol(format!(
                    "PUSH_PROMISE on stream {} in state {:?}",
                    origin, other
                )))
            }
        }

        let stream = core.streams.register(Stream::new(
            promised,
            core.remote.initial_window_size(),
            self.config.settings.initial_window_size(),
        ))?;
        stream.apply(StreamEvent::RecvPushPromise)?;
        stream.set_origin(origin);
        stream.set_promise(headers);
        debug!(conn = self.id, origin, promised, "push promise received");
        Ok(())
    }

    fn on_data(self: &Arc<Self>, frame: DataFrame) -> Result<()> {
        let id = frame.stream_id;
        let len = frame.flow_controlled_len();

        let mut guard = self.lock_core();
        let core = &mut *guard;

        if let Some(increment) = core.flow.receive_data(len)? {
            core.enqueue_frame(&Frame::WindowUpdate(WindowUpdateFrame::new(0, increment)))?;
        }

        let idle = self.is_idle(core, id);
        let stream = match core.streams.lookup_mut(id) {
            Some(stream) => stream,
            None if idle => {
                return Err(Error::Protocol(format!("DATA on idle stream {}", id)));
            }
            None => {
                core.enqueue_frame(&Frame::RstStream(RstStreamFrame::new(id, ErrorCode::StreamClosed)))?;
                return Ok(());
            }
        };

        stream.apply(StreamEvent::RecvData { end_stream: frame.end_stream })?;
        let update = stream.flow.receive_data(len)?;
        stream.append_body(&frame.data);

        if frame.end_stream {
            let message = Self::complete(core, id);
            drop(guard);
            if let Some(message) = message {
                self.dispatch(message);
            }
        } else if let Some(increment) = update {
            core.enqueue_frame(&Frame::WindowUpdate(WindowUpdateFrame::new(id, increment)))?;
        }
        Ok(())
    }

    fn on_window_update(&self, frame: WindowUpdateFrame) -> Result<()> {
        let mut guard = self.lock_core();
        let core = &mut *guard;

        if frame.stream_id == 0 {
            core.flow.send.increase(frame.size_increment)?;
        } else if let Some(stream) = core.streams.lookup_mut(frame.stream_id) {
            if let Err(e) = stream.flow.send.increase(frame.size_increment) {
                // Stream-level problem: reset only this stream
                let code = e.error_code();
                debug!(conn = self.id, stream = frame.stream_id, error = %e, "bad WINDOW_UPDATE");
                stream.apply(StreamEvent::SendReset)?;
                core.streams.remove(frame.stream_id);
                core.enqueue_frame(&Frame::RstStream(RstStreamFrame::new(frame.stream_id, code)))?;
            }
        }

        self.changed.notify_all();
        Ok(())
    }

    /// Take a fully received message off its stream
    fn complete(core: &mut Core, id: StreamId) -> Option<H2Message> {
        let stream = core.streams.lookup_mut(id)?;
        let origin = stream.origin();
        let promise = stream.take_promise();
        let (headers, body) = stream.take_message();
        core.retire(id);

        Some(H2Message {
            stream_id: id,
            headers,
            body,
            origin,
            promise,
        })
    }

    /// Run the handler for one message on its own thread
    fn dispatch(self: &Arc<Self>, message: H2Message) {
        let handler = match &self.handler {
            Some(handler) => Arc::clone(handler),
            None => return,
        };
        let conn = Arc::clone(self);
        let stream_id = message.stream_id;

        let spawned = thread::Builder::new()
            .name(format!("h2-handler-{}-{}", self.id, stream_id))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&conn, message)));
                let failure = match outcome {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) if e.is_benign_disconnect() => return,
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "handler panicked".to_string(),
                };
                warn!(conn = conn.id, stream = stream_id, error = %failure, "handler failed");
                if conn.stream_state(stream_id).is_some() {
                    let _ = conn.send_reset(stream_id, ErrorCode::InternalError);
                }
            });

        if let Err(e) = spawned {
            warn!(conn = self.id, stream = stream_id, error = %e, "cannot spawn handler");
            let _ = self.send_reset(stream_id, ErrorCode::RefusedStream);
        }
    }
}

fn writer_loop(transport: Arc<Transport>, rx: Receiver<Outbound>, conn: Weak<Connection>) {
    let mut failed: Option<String> = None;

    for msg in rx.iter() {
        let result = match &failed {
            Some(reason) => Err(reason.clone()),
            None => match transport.write_all(&msg.bytes) {
                Ok(()) => Ok(()),
                Err(e) => {
                    let reason = e.to_string();
                    failed = Some(reason.clone());
                    if let Some(conn) = conn.upgrade() {
                        conn.teardown(TeardownReason::Error(e));
                    }
                    Err(reason)
                }
            },
        };
        if let Some(ack) = msg.ack {
            let _ = ack.send(result);
        }
    }

    transport.close();
    if let Some(conn) = conn.upgrade() {
        conn.writer_finished();
    }
}

/// Socket-free connections for unit tests
///
/// The connection is already open; every queued write is captured and
/// acknowledged by a collector thread.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::http::h2::codec::FrameHeader;
    use std::io::Cursor;

    pub struct Harness {
        pub conn: Arc<Connection>,
        wire: Arc<Mutex<Vec<Bytes>>>,
        /// When set, acknowledgements report this failure
        fail_writes: Arc<Mutex<Option<String>>>,
    }

    impl Harness {
        pub fn responder(remote: Settings) -> Harness {
            Self::with_config(Role::Responder, ConnectionConfig::default(), remote)
        }

        pub fn with_config(role: Role, config: ConnectionConfig, remote: Settings) -> Harness {
            let (tx, rx) = mpsc::channel::<Outbound>();
            let conn = Arc::new(Connection::new(role, config, None, None, tx));
            {
                let mut core = conn.lock_core();
                core.state = ConnectionState::Open;
                core.remote = remote;
            }

            let wire = Arc::new(Mutex::new(Vec::new()));
            let fail_writes = Arc::new(Mutex::new(None::<String>));
            {
                let wire = Arc::clone(&wire);
                let fail_writes = Arc::clone(&fail_writes);
                thread::spawn(move || {
                    for msg in rx.iter() {
                        let verdict = match fail_writes.lock().unwrap().clone() {
                            Some(reason) => Err(reason),
                            None => {
                                wire.lock().unwrap().push(msg.bytes);
                                Ok(())
                            }
                        };
                        if let Some(ack) = msg.ack {
                            let _ = ack.send(verdict);
                        }
                    }
                });
            }

            Harness { conn, wire, fail_writes }
        }

        /// Pretend the peer opened `id` with a request
        pub fn open_peer_stream(&self, id: StreamId, end_stream: bool) {
            let mut core = self.conn.lock_core();
            let stream = core.streams.register(Stream::new(id, 65535, 65535)).unwrap();
            stream.apply(StreamEvent::RecvHeaders { end_stream }).unwrap();
        }

        pub fn set_state(&self, state: ConnectionState) {
            self.conn.lock_core().state = state;
        }

        /// Apply peer SETTINGS without going through the reader
        pub fn merge_remote(&self, settings: &Settings) {
            self.conn.lock_core().merge_remote(settings);
        }

        pub fn fail_writes(&self, reason: &str) {
            *self.fail_writes.lock().unwrap() = Some(reason.to_string());
        }

        /// Every frame written so far, in wire order
        pub fn frames(&self) -> Vec<Frame> {
            let bytes: Vec<u8> = self.wire.lock().unwrap().iter().flat_map(|b| b.iter().copied()).collect();
            let mut cursor = Cursor::new(&bytes[..]);
            let mut frames = Vec::new();
            while (cursor.position() as usize) < bytes.len() {
                let (header, payload): (FrameHeader, Bytes) = codec::read_frame(&mut cursor, 1 << 24).unwrap();
                frames.push(codec::parse(header, payload).unwrap());
            }
            frames
        }

        /// Wait until the collector saw at least `n` frames
        pub fn wait_for_frames(&self, n: usize) -> Vec<Frame> {
            for _ in 0..200 {
                let frames = self.frames();
                if frames.len() >= n {
                    return frames;
                }
                thread::sleep(Duration::from_millis(5));
            }
            self.frames()
        }
    }
}
