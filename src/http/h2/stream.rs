//! HTTP/2 stream state machine
//!
//! This module implements the stream lifecycle defined in RFC 7540 Section 5.1.
//! [`transition`] is the whole legal edge set; everything outside it is an
//! [`Error::IllegalStreamTransition`], which the connection treats as fatal.

use super::error::{Error, Result};
use super::flow_control::FlowControl;
use super::hpack::HeaderList;
use bytes::{Bytes, BytesMut};

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 7540 Section 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No frames have been sent/received
    Idle,
    /// PUSH_PROMISE sent
    ReservedLocal,
    /// PUSH_PROMISE received
    ReservedRemote,
    /// Both sides can send frames
    Open,
    /// We can't send, they can
    HalfClosedLocal,
    /// They can't send, we can
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// Something that happened to a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    SendPushPromise,
    RecvPushPromise,
    SendHeaders { end_stream: bool },
    RecvHeaders { end_stream: bool },
    SendData { end_stream: bool },
    RecvData { end_stream: bool },
    SendReset,
    RecvReset,
}

/// Next state for `event` in state `from`, or `None` if the edge is illegal
pub fn transition(from: StreamState, event: StreamEvent) -> Option<StreamState> {
    use StreamEvent::*;
    use StreamState::*;

    let next = match (from, event) {
        (Closed, _) => return None,
        (_, SendReset) | (_, RecvReset) if from != Idle => Closed,

        (Idle, SendPushPromise) => ReservedLocal,
        (Idle, RecvPushPromise) => ReservedRemote,
        (Idle, SendHeaders { end_stream }) => pick(end_stream, HalfClosedLocal, Open),
        (Idle, RecvHeaders { end_stream }) => pick(end_stream, HalfClosedRemote, Open),

        // A reserved stream skips Open: the side that did not promise never sends
        (ReservedLocal, SendHeaders { end_stream }) => pick(end_stream, Closed, HalfClosedRemote),
        (ReservedRemote, RecvHeaders { end_stream }) => pick(end_stream, Closed, HalfClosedLocal),

        (Open, SendHeaders { end_stream }) | (Open, SendData { end_stream }) => {
            pick(end_stream, HalfClosedLocal, Open)
        }
        (Open, RecvHeaders { end_stream }) | (Open, RecvData { end_stream }) => {
            pick(end_stream, HalfClosedRemote, Open)
        }

        (HalfClosedLocal, RecvHeaders { end_stream }) | (HalfClosedLocal, RecvData { end_stream }) => {
            pick(end_stream, Closed, HalfClosedLocal)
        }
        (HalfClosedRemote, SendHeaders { end_stream }) | (HalfClosedRemote, SendData { end_stream }) => {
            pick(end_stream, Closed, HalfClosedRemote)
        }

        _ => return None,
    };

    Some(next)
}

fn pick(end_stream: bool, ended: StreamState, otherwise: StreamState) -> StreamState {
    if end_stream {
        ended
    } else {
        otherwise
    }
}

/// HTTP/2 stream
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    state: StreamState,
    pub flow: FlowControl,
    /// Stream this one was promised on, for pushed streams
    origin: Option<StreamId>,
    /// Request headers a PUSH_PROMISE announced for this stream
    promise: Option<HeaderList>,
    /// Decoded header blocks received so far (request or response, then trailers)
    headers: Option<HeaderList>,
    body: BytesMut,
}

impl Stream {
    /// Create an idle stream with the given send/receive window sizes
    pub fn new(id: StreamId, send_window: u32, recv_window: u32) -> Self {
        Stream {
            id,
            state: StreamState::Idle,
            flow: FlowControl::new(send_window, recv_window),
            origin: None,
            promise: None,
            headers: None,
            body: BytesMut::new(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn origin(&self) -> Option<StreamId> {
        self.origin
    }

    pub fn set_origin(&mut self, origin: StreamId) {
        self.origin = Some(origin);
    }

    pub fn set_promise(&mut self, headers: HeaderList) {
        self.promise = Some(headers);
    }

    pub fn promise(&self) -> Option<&HeaderList> {
        self.promise.as_ref()
    }

    pub fn take_promise(&mut self) -> Option<HeaderList> {
        self.promise.take()
    }

    /// Drive the state machine
    pub fn apply(&mut self, event: StreamEvent) -> Result<StreamState> {
        match transition(self.state, event) {
            Some(next) => {
                self.state = next;
                Ok(next)
            }
            None => Err(Error::IllegalStreamTransition {
                stream_id: self.id,
                from: self.state,
                event,
            }),
        }
    }

    /// Record a decoded header block; later blocks (trailers) are appended
    pub fn add_headers(&mut self, list: HeaderList) {
        match &mut self.headers {
            Some(existing) => {
                for (name, value) in list.iter() {
                    existing.push(name, value);
                }
            }
            None => self.headers = Some(list),
        }
    }

    pub fn headers(&self) -> Option<&HeaderList> {
        self.headers.as_ref()
    }

    pub fn append_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// Hand the received message to the application
    pub fn take_message(&mut self) -> (HeaderList, Bytes) {
        let headers = self.headers.take().unwrap_or_default();
        (headers, self.body.split().freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StreamEvent::*;
    use StreamState::*;

    #[test]
    fn test_push_path() {
        let mut stream = Stream::new(2, 65535, 65535);
        assert_eq!(stream.apply(SendPushPromise).unwrap(), ReservedLocal);
        assert_eq!(stream.apply(SendHeaders { end_stream: false }).unwrap(), HalfClosedRemote);
        assert_eq!(stream.apply(SendData { end_stream: false }).unwrap(), HalfClosedRemote);
        assert_eq!(stream.apply(SendData { end_stream: true }).unwrap(), Closed);
    }

    #[test]
    fn test_request_path() {
        let mut stream = Stream::new(1, 65535, 65535);
        assert_eq!(stream.apply(RecvHeaders { end_stream: false }).unwrap(), Open);
        assert_eq!(stream.apply(RecvData { end_stream: true }).unwrap(), HalfClosedRemote);
        assert_eq!(stream.apply(SendHeaders { end_stream: true }).unwrap(), Closed);
    }

    #[test]
    fn test_client_side_of_push() {
        assert_eq!(transition(Idle, RecvPushPromise), Some(ReservedRemote));
        assert_eq!(transition(ReservedRemote, RecvHeaders { end_stream: false }), Some(HalfClosedLocal));
        assert_eq!(transition(HalfClosedLocal, RecvData { end_stream: true }), Some(Closed));
    }

    #[test]
    fn test_promise_is_kept_until_taken() {
        let mut stream = Stream::new(2, 65535, 65535);
        stream.apply(RecvPushPromise).unwrap();
        stream.set_origin(1);
        stream.set_promise(HeaderList::request("GET", "https", "example.com", "/app.js"));

        assert_eq!(stream.origin(), Some(1));
        assert_eq!(stream.promise().and_then(|p| p.get(":path")), Some("/app.js"));
        assert!(stream.take_promise().is_some());
        assert!(stream.promise().is_none());
    }

    #[test]
    fn test_resets_close_everything_but_idle() {
        for state in [ReservedLocal, ReservedRemote, Open, HalfClosedLocal, HalfClosedRemote] {
            assert_eq!(transition(state, RecvReset), Some(Closed));
            assert_eq!(transition(state, SendReset), Some(Closed));
        }
        assert_eq!(transition(Idle, RecvReset), None);
        assert_eq!(transition(Closed, SendReset), None);
    }

    #[test]
    fn test_illegal_transitions() {
        assert_eq!(transition(Idle, SendData { end_stream: false }), None);
        assert_eq!(transition(ReservedLocal, RecvHeaders { end_stream: false }), None);
        assert_eq!(transition(HalfClosedRemote, RecvData { end_stream: false }), None);
        assert_eq!(transition(HalfClosedLocal, SendHeaders { end_stream: false }), None);
        assert_eq!(transition(Open, SendPushPromise), None);

        let mut stream = Stream::new(3, 65535, 65535);
        stream.apply(RecvHeaders { end_stream: true }).unwrap();
        let err = stream.apply(RecvData { end_stream: false }).unwrap_err();
        assert!(matches!(
            err,
            Error::IllegalStreamTransition {
                stream_id: 3,
                from: HalfClosedRemote,
                ..
            }
        ));
        // A failed transition leaves the state alone
        assert_eq!(stream.state(), HalfClosedRemote);
    }

    #[test]
    fn test_message_accumulation() {
        let mut stream = Stream::new(1, 65535, 65535);
        stream.add_headers(HeaderList::request("POST", "http", "localhost", "/upload"));
        stream.append_body(b"hello ");
        stream.append_body(b"world");

        let mut trailers = HeaderList::new();
        trailers.push("x-checksum", "abc");
        stream.add_headers(trailers);

        let (headers, body) = stream.take_message();
        assert_eq!(headers.get(":path"), Some("/upload"));
        assert_eq!(headers.get("x-checksum"), Some("abc"));
        assert_eq!(&body[..], b"hello world");
    }
}
