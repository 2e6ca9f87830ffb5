//! Server push
//!
//! [`Connection::push_promise`] reserves the next even stream id and
//! announces it with a PUSH_PROMISE on an existing client stream. The
//! returned [`StreamHandle`] is then used to send the pushed response.
//!
//! Every rejection (push disabled, origin unusable, concurrency limit) is
//! decided before the stream table or the header encoder is touched, so a
//! rejected push leaves no trace on the connection or the wire.

use super::connection::{Connection, Role, TeardownReason};
use super::error::{Error, ErrorCode, Result};
use super::hpack::HeaderList;
use super::stream::{StreamId, StreamState};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Handle to a stream this side reserved
///
/// Holds the connection weakly; once the connection is gone every call fails
/// with [`Error::ConnectionClosed`].
#[derive(Debug, Clone)]
pub struct StreamHandle {
    conn: Weak<Connection>,
    id: StreamId,
}

impl StreamHandle {
    pub fn id(&self) -> StreamId {
        self.id
    }

    fn conn(&self) -> Result<Arc<Connection>> {
        self.conn.upgrade().ok_or(Error::ConnectionClosed)
    }

    /// Current state, `None` once the stream left the table
    pub fn state(&self) -> Option<StreamState> {
        self.conn.upgrade().and_then(|conn| conn.stream_state(self.id))
    }

    pub fn send_response(&self, status: u16, headers: &[(&str, &str)], body: &[u8]) -> Result<()> {
        self.conn()?.send_response(self.id, status, headers, body)
    }

    pub fn send_headers(&self, headers: &HeaderList, end_stream: bool) -> Result<()> {
        self.conn()?.send_headers(self.id, headers, end_stream)
    }

    pub fn send_data(&self, data: &[u8], end_stream: bool) -> Result<()> {
        self.conn()?.send_data(self.id, data, end_stream)
    }

    /// Abandon the push
    pub fn reset(&self, code: ErrorCode) -> Result<()> {
        self.conn()?.send_reset(self.id, code)
    }
}

impl Connection {
    /// Announce a pushed resource on `origin`
    ///
    /// The promised stream is reserved, its request headers encoded and
    /// the PUSH_PROMISE queued in one critical section. The call then waits
    /// for the writer to put the frame on the wire. A write failure is
    /// reported as [`Error::PushTransmissionFailed`]; the stream stays
    /// reserved.
    #[allow(clippy::too_many_arguments)]
    pub fn push_promise(
        self: &Arc<Self>,
        origin: StreamId,
        method: &str,
        scheme: &str,
        authority: &str,
        path: &str,
        extra: &[(&str, &str)],
    ) -> Result<StreamHandle> {
        if self.role() != Role::Responder {
            return Err(Error::PushDisabled("only the responder can push"));
        }

        let mut request = HeaderList::request(method, scheme, authority, path);
        request.extend_regular(extra);
        let (promised, verdict) = self.reserve_push(origin, &request)?;
        debug!(conn = self.id(), origin, promised, path, "push reserved");

        let outcome = match verdict {
            Ok(rx) => match rx.recv() {
                Ok(Ok(())) => Ok(()),
                Ok(Err(reason)) => Err(reason),
                Err(_) => Err("writer exited".to_string()),
            },
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(()) => Ok(StreamHandle {
                conn: Arc::downgrade(self),
                id: promised,
            }),
            Err(reason) => {
                warn!(conn = self.id(), promised, reason = %reason, "push promise not sent");
                if self.config().escalate_push_failures {
                    self.teardown(TeardownReason::Error(Error::PushTransmissionFailed {
                        stream_id: promised,
                        reason: reason.clone(),
                    }));
                }
                Err(Error::PushTransmissionFailed {
                    stream_id: promised,
                    reason,
                })
            }
        }
    }

    /// [`push_promise`](Self::push_promise) with this connection's own
    /// scheme and authority
    pub fn push(
        self: &Arc<Self>,
        origin: StreamId,
        method: &str,
        path: &str,
        extra: &[(&str, &str)],
    ) -> Result<StreamHandle> {
        self.push_promise(origin, method, self.scheme(), self.authority(), path, extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::connection::testing::Harness;
    use crate::http::h2::connection::{ConnectionConfig, ConnectionState};
    use crate::http::h2::frames::Frame;
    use crate::http::h2::hpack::HeaderDecoder;
    use crate::http::h2::settings::{Settings, SettingsBuilder};
    use std::thread;

    fn push_enabled(limit: u32) -> Settings {
        SettingsBuilder::new()
            .enable_push(true)
            .max_concurrent_streams(limit)
            .build()
            .unwrap()
    }

    fn push_promises(frames: &[Frame]) -> Vec<(StreamId, StreamId, HeaderList)> {
        let mut decoder = HeaderDecoder::new();
        frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::PushPromise(p) => Some((
                    p.stream_id,
                    p.promised_stream_id,
                    decoder.decode(&p.header_block).unwrap(),
                )),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_push_on_open_stream() {
        let harness = Harness::responder(push_enabled(10));
        harness.open_peer_stream(3, true);

        let handle = harness
            .conn
            .push_promise(3, "GET", "https", "example.com", "/style.css", &[])
            .unwrap();

        assert_eq!(handle.id(), 2);
        assert_eq!(handle.state(), Some(StreamState::ReservedLocal));

        let frames = harness.frames();
        assert_eq!(frames.len(), 1);
        let promises = push_promises(&frames);
        let (origin, promised, headers) = &promises[0];
        assert_eq!((*origin, *promised), (3, 2));
        let decoded: Vec<(&str, &str)> = headers.iter().collect();
        assert_eq!(
            decoded,
            [
                (":method", "GET"),
                (":scheme", "https"),
                (":authority", "example.com"),
                (":path", "/style.css"),
            ]
        );
    }

    #[test]
    fn test_push_disabled_leaves_no_trace() {
        let remote = SettingsBuilder::new()
            .enable_push(false)
            .max_concurrent_streams(10)
            .build()
            .unwrap();
        let harness = Harness::responder(remote);
        harness.open_peer_stream(3, true);

        let err = harness
            .conn
            .push_promise(3, "GET", "https", "example.com", "/style.css", &[])
            .unwrap_err();

        assert!(matches!(err, Error::PushDisabled(_)));
        assert!(!err.is_connection_fatal());
        assert_eq!(harness.conn.stream_count(), 1);
        assert_eq!(harness.conn.next_stream_id(), 2);
        assert!(harness.frames().is_empty());
    }

    #[test]
    fn test_push_at_limit_is_rejected() {
        let harness = Harness::responder(push_enabled(2));
        harness.open_peer_stream(1, true);
        harness.conn.push(1, "GET", "/a.js", &[]).unwrap();

        let err = harness.conn.push(1, "GET", "/b.js", &[]).unwrap_err();
        assert!(matches!(err, Error::ConcurrencyLimitExceeded { active: 2, limit: 2 }));
        assert_eq!(harness.conn.stream_count(), 2);
        assert_eq!(harness.conn.next_stream_id(), 4);
        assert_eq!(harness.frames().len(), 1);
    }

    #[test]
    fn test_pushed_ids_increase_by_two() {
        let harness = Harness::responder(push_enabled(100));
        harness.open_peer_stream(1, true);

        let ids: Vec<StreamId> = ["/a", "/b", "/c", "/d"]
            .iter()
            .map(|path| harness.conn.push(1, "GET", path, &[]).unwrap().id())
            .collect();
        assert_eq!(ids, [2, 4, 6, 8]);
    }

    #[test]
    fn test_push_requires_usable_origin() {
        let harness = Harness::responder(push_enabled(10));
        assert!(matches!(
            harness.conn.push(5, "GET", "/x", &[]),
            Err(Error::StreamNotFound(5))
        ));

        harness.open_peer_stream(1, true);
        let pushed = harness.conn.push(1, "GET", "/x", &[]).unwrap();
        assert!(matches!(
            harness.conn.push(pushed.id(), "GET", "/y", &[]),
            Err(Error::PushDisabled(_))
        ));
    }

    #[test]
    fn test_push_after_goaway_is_rejected() {
        let harness = Harness::responder(push_enabled(10));
        harness.open_peer_stream(1, true);
        harness.set_state(ConnectionState::GoingAway);

        assert!(matches!(
            harness.conn.push(1, "GET", "/x", &[]),
            Err(Error::PushDisabled(_))
        ));
        assert_eq!(harness.conn.next_stream_id(), 2);
    }

    #[test]
    fn test_extra_headers_keep_caller_order() {
        let harness = Harness::responder(push_enabled(10));
        harness.open_peer_stream(1, true);
        harness
            .conn
            .push(1, "GET", "/app.js", &[("X-B", "2"), ("x-a", "1"), ("x-b", "3")])
            .unwrap();

        let promises = push_promises(&harness.frames());
        let extras: Vec<(&str, &str)> = promises[0].2.iter().skip(4).collect();
        assert_eq!(extras, [("x-b", "2"), ("x-a", "1"), ("x-b", "3")]);
        assert_eq!(promises[0].2.get(":scheme"), Some("http"));
        assert_eq!(promises[0].2.get(":authority"), Some("localhost"));
    }

    #[test]
    fn test_pushed_response_closes_stream() {
        let harness = Harness::responder(push_enabled(10));
        harness.open_peer_stream(1, true);
        let handle = harness.conn.push(1, "GET", "/style.css", &[]).unwrap();

        handle.send_response(200, &[("content-type", "text/css")], b"body{}").unwrap();
        assert_eq!(handle.state(), None);

        let frames = harness.wait_for_frames(3);
        assert!(matches!(&frames[1], Frame::Headers(h) if h.stream_id == 2 && !h.end_stream));
        assert!(matches!(&frames[2], Frame::Data(d) if d.stream_id == 2 && d.end_stream));
    }

    #[test]
    fn test_transmission_failure_is_reported() {
        let harness = Harness::responder(push_enabled(10));
        harness.open_peer_stream(1, true);
        harness.fail_writes("broken pipe");

        let err = harness.conn.push(1, "GET", "/x", &[]).unwrap_err();
        assert!(matches!(err, Error::PushTransmissionFailed { stream_id: 2, .. }));
        assert_eq!(harness.conn.stream_state(2), Some(StreamState::ReservedLocal));
        assert_eq!(harness.conn.state(), ConnectionState::Open);
    }

    #[test]
    fn test_transmission_failure_can_escalate() {
        let config = ConnectionConfig::builder().escalate_push_failures(true).build().unwrap();
        let harness = Harness::with_config(Role::Responder, config, push_enabled(10));
        harness.open_peer_stream(1, true);
        harness.fail_writes("broken pipe");

        assert!(harness.conn.push(1, "GET", "/x", &[]).is_err());
        assert_eq!(harness.conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_lowered_limit_applies_to_next_push() {
        let harness = Harness::responder(push_enabled(10));
        harness.open_peer_stream(1, true);
        harness.conn.push(1, "GET", "/a", &[]).unwrap();

        harness.merge_remote(&push_enabled(2));
        assert!(harness.conn.push(1, "GET", "/b", &[]).is_err());
    }

    #[test]
    fn test_concurrent_header_blocks_decode_in_wire_order() {
        let harness = Harness::responder(push_enabled(1000));
        for id in [1, 3, 5, 7] {
            harness.open_peer_stream(id, true);
        }

        let workers: Vec<_> = [1u32, 3, 5, 7]
            .into_iter()
            .map(|origin| {
                let conn = Arc::clone(&harness.conn);
                thread::spawn(move || {
                    let tag = origin.to_string();
                    for n in 0..20 {
                        let path = format!("/{}/{}", origin, n);
                        conn.push(origin, "GET", &path, &[("x-origin", tag.as_str())]).unwrap();
                    }
                    conn.send_response(origin, 200, &[("x-origin", tag.as_str())], b"").unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        // A single decoder replaying the wire must agree with every block,
        // which only holds if encode order matched queue order.
        let mut decoder = HeaderDecoder::new();
        let mut blocks = 0;
        for frame in harness.wait_for_frames(4 * 21) {
            let (stream_id, block) = match &frame {
                Frame::PushPromise(p) => (p.stream_id, &p.header_block),
                Frame::Headers(h) => (h.stream_id, &h.header_block),
                _ => continue,
            };
            let headers = decoder.decode(block).unwrap();
            assert_eq!(headers.get("x-origin"), Some(stream_id.to_string().as_str()));
            blocks += 1;
        }
        assert_eq!(blocks, 4 * 21);
    }
}
