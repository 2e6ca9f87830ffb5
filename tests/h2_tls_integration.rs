//! HTTP/2 over TLS integration tests
//!
//! These tests verify:
//! - ALPN negotiation of "h2" against the built-in server identity
//! - Push and response delivery to an initiator over TLS
//! - `https` as the scheme of pushes on a TLS connection
//! - Rejection of clients that do not negotiate h2
//! - A client stalled mid-record not holding up pushes
//!
//! Each scenario runs against TLS 1.2 and TLS 1.3 servers.

use h2push::http::h2::codec;
use h2push::http::h2::frames::*;
use h2push::http::h2::*;
use h2push::http::tls::{TlsConfig, TlsVersion, ALPN_H2};
use h2push::http::SessionOps;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const VERSIONS: [TlsVersion; 2] = [TlsVersion::Tls12, TlsVersion::Tls13];

fn start_tls_server<H: Handler + 'static>(version: TlsVersion, handler: H) -> Arc<Server> {
    let tls = TlsConfig::server().version(version).build().unwrap();
    let config = ServerConfig::builder()
        .tls(tls)
        .authority("localhost")
        .build()
        .unwrap();
    let server = Arc::new(Server::bind(config, Arc::new(handler)).unwrap());
    {
        let server = Arc::clone(&server);
        thread::spawn(move || server.run());
    }
    server
}

fn tls_client(addr: SocketAddr, alpn: &[&str]) -> Result<h2push::http::tls::TlsSessionOps> {
    let config = TlsConfig::client().alpn(alpn).servername("localhost").build()?;
    let socket = TcpStream::connect(addr)?;
    Ok(config.connect(socket)?)
}

fn connect_h2(addr: SocketAddr, handler: impl Handler + 'static) -> Arc<Connection> {
    let session = tls_client(addr, &[ALPN_H2]).unwrap();
    assert_eq!(session.alpn_protocol().as_deref(), Some(ALPN_H2.as_bytes()));

    let config = ConnectionConfig::builder()
        .settings(SettingsBuilder::new().enable_push(true).build().unwrap())
        .authority("localhost")
        .build()
        .unwrap();
    Connection::establish(Box::new(session), Role::Initiator, config, Arc::new(handler)).unwrap()
}

fn collector() -> (impl Handler, mpsc::Receiver<H2Message>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let handler = move |_: &Arc<Connection>, msg: H2Message| -> Result<()> {
        let _ = tx.lock().unwrap().send(msg);
        Ok(())
    };
    (handler, rx)
}

#[test]
fn test_tls_request_response() {
    for version in VERSIONS {
        let server = start_tls_server(version, |conn: &Arc<Connection>, msg: H2Message| {
            assert!(conn.is_secure());
            conn.send_response(msg.stream_id, 200, &[("content-type", "text/plain")], b"secure hello")
        });

        let (handler, rx) = collector();
        let client = connect_h2(server.local_addr(), handler);
        assert!(client.is_secure());

        let id = client.send_request("GET", "/", &[], b"").unwrap();
        let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(msg.stream_id, id);
        assert_eq!(msg.status(), Some(200));
        assert_eq!(msg.headers.get("content-type"), Some("text/plain"));
        assert_eq!(&msg.body[..], b"secure hello");

        client.close();
        client.run_until_closed();
        server.shutdown();
    }
}

#[test]
fn test_tls_push_uses_https_scheme() {
    for version in VERSIONS {
        let server = start_tls_server(version, |conn: &Arc<Connection>, msg: H2Message| {
            let pushed = conn.push(msg.stream_id, "GET", "/style.css", &[("x-pushed", "yes")])?;
            pushed.send_response(200, &[("content-type", "text/css")], b"body {}")?;
            conn.send_response(msg.stream_id, 200, &[("content-type", "text/html")], b"<html/>")
        });

        let (handler, rx) = collector();
        let client = connect_h2(server.local_addr(), handler);
        client.send_request("GET", "/", &[], b"").unwrap();

        let mut messages: Vec<H2Message> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        messages.sort_by_key(|m| m.stream_id);

        assert_eq!(messages[0].stream_id, 1);
        assert_eq!(&messages[0].body[..], b"<html/>");

        let pushed = &messages[1];
        assert_eq!(pushed.stream_id, 2);
        assert!(pushed.is_push());
        let promise = pushed.promise.as_ref().unwrap();
        let fields: Vec<(&str, &str)> = promise.iter().collect();
        assert_eq!(
            fields,
            [
                (":method", "GET"),
                (":scheme", "https"),
                (":authority", "localhost"),
                (":path", "/style.css"),
                ("x-pushed", "yes"),
            ]
        );
        assert_eq!(pushed.headers.get("content-type"), Some("text/css"));

        client.close();
        client.run_until_closed();
        server.shutdown();
    }
}

#[test]
fn test_several_requests_on_one_tls_connection() {
    for version in VERSIONS {
        let server = start_tls_server(version, |conn: &Arc<Connection>, msg: H2Message| {
            let path = msg.path().unwrap_or("/").to_string();
            conn.send_response(msg.stream_id, 200, &[], path.as_bytes())
        });

        let (handler, rx) = collector();
        let client = connect_h2(server.local_addr(), handler);
        let ids: Vec<StreamId> = ["/a", "/b", "/c"]
            .iter()
            .map(|path| client.send_request("GET", path, &[], b"").unwrap())
            .collect();
        assert_eq!(ids, [1, 3, 5]);

        let mut bodies: Vec<(StreamId, Vec<u8>)> = (0..3)
            .map(|_| {
                let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
                (msg.stream_id, msg.body.to_vec())
            })
            .collect();
        bodies.sort();
        assert_eq!(
            bodies,
            [(1, b"/a".to_vec()), (3, b"/b".to_vec()), (5, b"/c".to_vec())]
        );

        client.close();
        client.run_until_closed();
        server.shutdown();
    }
}

#[test]
fn test_client_without_h2_alpn_is_dropped() {
    for version in VERSIONS {
        let server = start_tls_server(version, NotFound);

        // The TLS handshake itself may succeed with no protocol selected; the
        // server must then close without speaking HTTP/2.
        match tls_client(server.local_addr(), &["http/1.1"]) {
            Ok(mut session) => {
                assert_eq!(session.alpn_protocol(), None);
                session.socket().set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                let mut buf = [0u8; 16];
                let n = session.read(&mut buf).unwrap_or(0);
                assert_eq!(n, 0);
            }
            Err(_) => {}
        }

        // The acceptor keeps serving well-behaved clients
        let (handler, rx) = collector();
        let client = connect_h2(server.local_addr(), handler);
        client.send_request("GET", "/nothing", &[], b"").unwrap();
        let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(msg.status(), Some(404));

        client.close();
        client.run_until_closed();
        server.shutdown();
    }
}

#[test]
fn test_repeated_tls13_handshakes() {
    let server = start_tls_server(TlsVersion::Tls13, |conn: &Arc<Connection>, msg: H2Message| {
        conn.send_response(msg.stream_id, 204, &[], b"")
    });

    for _ in 0..20 {
        let (handler, rx) = collector();
        let client = connect_h2(server.local_addr(), handler);
        client.send_request("GET", "/", &[], b"").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().status(), Some(204));
        client.close();
        client.run_until_closed();
    }
    server.shutdown();
}

/// Client socket that can hold back outgoing TLS records
#[derive(Debug)]
struct Tap {
    socket: TcpStream,
    held: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Read for Tap {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.read(buf)
    }
}

impl Write for Tap {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(held) = self.held.lock().unwrap().as_mut() {
            held.extend_from_slice(buf);
            return Ok(buf.len());
        }
        self.socket.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.socket.flush()
    }
}

#[test]
fn test_partial_record_does_not_stall_push() {
    for version in VERSIONS {
        let (pushed_tx, pushed_rx) = mpsc::channel();
        let pushed_tx = Mutex::new(pushed_tx);
        let server = start_tls_server(version, move |conn: &Arc<Connection>, msg: H2Message| {
            // Give the truncated record time to reach the server's reader
            thread::sleep(Duration::from_millis(200));
            let started = Instant::now();
            let pushed = conn.push(msg.stream_id, "GET", "/style.css", &[])?;
            let _ = pushed_tx.lock().unwrap().send(started.elapsed());
            pushed.send_response(200, &[], b"body {}")?;
            conn.send_response(msg.stream_id, 200, &[], b"<html/>")
        });

        let socket = TcpStream::connect(server.local_addr()).unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let raw = socket.try_clone().unwrap();
        let held = Arc::new(Mutex::new(None));
        let mut connector = SslConnector::builder(SslMethod::tls()).unwrap();
        connector.set_verify(SslVerifyMode::NONE);
        connector.set_alpn_protos(b"\x02h2").unwrap();
        let tap = Tap {
            socket,
            held: Arc::clone(&held),
        };
        let mut tls = connector.build().connect("localhost", tap).unwrap();

        let mut encoder = HeaderEncoder::new();
        let block = encoder
            .encode(&HeaderList::request("GET", "https", "localhost", "/"))
            .unwrap();
        let mut opening = CONNECTION_PREFACE.to_vec();
        opening.extend_from_slice(&codec::serialize(&Frame::Settings(SettingsFrame::new(Settings::new()))));
        opening.extend_from_slice(&codec::serialize_headers(1, &block, true, 16384));
        tls.write_all(&opening).unwrap();

        // Encrypt a PING but put only the first bytes of its record on the wire
        *held.lock().unwrap() = Some(Vec::new());
        tls.write_all(&codec::serialize(&Frame::Ping(PingFrame::new([7; 8])))).unwrap();
        let record = held.lock().unwrap().take().unwrap();
        (&raw).write_all(&record[..3]).unwrap();

        let elapsed = pushed_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("push stalled behind the partial record");
        assert!(elapsed < Duration::from_secs(2), "{:?}: push took {:?}", version, elapsed);

        let mut promised = None;
        loop {
            let (header, payload) = codec::read_frame(&mut tls, 1 << 24).unwrap();
            match codec::parse(header, payload).unwrap() {
                Frame::PushPromise(p) => promised = Some(p.promised_stream_id),
                Frame::Headers(h) if h.stream_id == 1 => break,
                _ => {}
            }
        }
        assert_eq!(promised, Some(2));
        server.shutdown();
    }
}
