//! HTTP/2 Performance Benchmarks
//!
//! This benchmark suite measures:
//! - Frame serialization and parsing
//! - Header blocks split across CONTINUATION frames
//! - Stream state transitions and stream table reservation
//! - HPACK header compression/decompression
//! - The push-promise critical section (reserve, encode, serialize)
//!
//! Run with: cargo bench --bench h2_performance

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use h2push::http::h2::{
    codec::{self, FrameHeader, FRAME_HEADER_SIZE},
    flow_control::FlowControl,
    frames::{DataFrame, Frame, SettingsFrame},
    hpack::{HeaderDecoder, HeaderEncoder, HeaderList},
    stream::{transition, StreamEvent, StreamState},
    stream_table::StreamTable,
    Role, Settings, SettingsBuilder, DEFAULT_MAX_FRAME_SIZE,
};
use std::time::Duration;

fn request_headers(path: &str) -> HeaderList {
    let mut list = HeaderList::request("GET", "https", "example.com", path);
    list.extend_regular(&[
        ("user-agent", "h2push-bench/1.0"),
        ("accept", "text/html,application/xhtml+xml"),
        ("accept-encoding", "gzip, deflate, br"),
        ("cookie", "session=0123456789abcdef"),
    ]);
    list
}

// ========== Frame Serialization ==========

fn bench_frame_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_serialize");

    let settings = Frame::Settings(SettingsFrame::new(Settings::server_defaults()));
    group.bench_function("settings", |b| {
        b.iter(|| black_box(codec::serialize(black_box(&settings))));
    });

    for size in [1024usize, 16384] {
        let frame = Frame::Data(DataFrame::new(1, Bytes::from(vec![0u8; size]), false));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("data", size), &frame, |b, frame| {
            b.iter(|| black_box(codec::serialize(black_box(frame))));
        });
    }

    group.finish();
}

fn bench_frame_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_parse");

    let wire = codec::serialize(&Frame::Data(DataFrame::new(1, Bytes::from(vec![7u8; 4096]), true)));
    let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
    header_bytes.copy_from_slice(&wire[..FRAME_HEADER_SIZE]);
    let payload = wire.slice(FRAME_HEADER_SIZE..);

    group.bench_function("header", |b| {
        b.iter(|| black_box(FrameHeader::decode(black_box(&header_bytes))));
    });

    group.bench_function("data_4kb", |b| {
        b.iter(|| {
            let header = FrameHeader::decode(&header_bytes);
            black_box(codec::parse(header, payload.clone()).ok())
        });
    });

    group.finish();
}

fn bench_header_block_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_block_split");

    for size in [1000usize, 40_000] {
        let block = vec![0x82u8; size];
        group.bench_with_input(BenchmarkId::new("headers", size), &block, |b, block| {
            b.iter(|| black_box(codec::serialize_headers(1, block, true, DEFAULT_MAX_FRAME_SIZE)));
        });
        group.bench_with_input(BenchmarkId::new("push_promise", size), &block, |b, block| {
            b.iter(|| black_box(codec::serialize_push_promise(1, 2, block, DEFAULT_MAX_FRAME_SIZE)));
        });
    }

    group.finish();
}

// ========== Stream Management ==========

fn bench_stream_transitions(c: &mut Criterion) {
    c.bench_function("stream_push_lifecycle", |b| {
        b.iter(|| {
            let mut state = StreamState::Idle;
            for event in [
                StreamEvent::SendPushPromise,
                StreamEvent::SendHeaders { end_stream: false },
                StreamEvent::SendData { end_stream: true },
            ] {
                state = transition(state, black_box(event)).unwrap_or(StreamState::Closed);
            }
            black_box(state)
        });
    });
}

fn bench_stream_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_table");

    for count in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("reserve", count), &count, |b, &count| {
            b.iter(|| {
                let mut table = StreamTable::new(Role::Responder);
                for _ in 0..count {
                    black_box(table.try_reserve(None, 65535, 65535).ok().map(|s| s.id()));
                }
                black_box(table.len())
            });
        });
    }

    group.bench_function("reserve_at_limit", |b| {
        let mut table = StreamTable::new(Role::Responder);
        for _ in 0..10 {
            let _ = table.try_reserve(Some(10), 65535, 65535);
        }
        b.iter(|| black_box(table.try_reserve(Some(10), 65535, 65535).is_err()));
    });

    group.finish();
}

fn bench_flow_control(c: &mut Criterion) {
    c.bench_function("flow_receive_data", |b| {
        b.iter(|| {
            let mut flow = FlowControl::new(65535, 65535);
            let mut updates = 0u32;
            for _ in 0..64 {
                if let Ok(Some(increment)) = flow.receive_data(black_box(1024)) {
                    updates += increment;
                }
            }
            black_box(updates)
        });
    });
}

// ========== HPACK ==========

fn bench_hpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("hpack");
    let headers = request_headers("/index.html");

    group.bench_function("encode_fresh_context", |b| {
        b.iter(|| {
            let mut encoder = HeaderEncoder::new();
            black_box(encoder.encode(black_box(&headers)).ok())
        });
    });

    group.bench_function("encode_warm_context", |b| {
        let mut encoder = HeaderEncoder::new();
        b.iter(|| black_box(encoder.encode(black_box(&headers)).ok()));
    });

    let block = HeaderEncoder::new().encode(&headers).unwrap_or_default();
    group.bench_function("decode", |b| {
        b.iter(|| {
            let mut decoder = HeaderDecoder::new();
            black_box(decoder.decode(black_box(&block)).ok())
        });
    });

    group.finish();
}

// ========== Push Promise ==========

fn bench_push_reservation(c: &mut Criterion) {
    let remote = SettingsBuilder::new()
        .enable_push(true)
        .max_concurrent_streams(1_000_000)
        .build()
        .unwrap_or_default();

    c.bench_function("push_promise_critical_section", |b| {
        let mut table = StreamTable::new(Role::Responder);
        let mut encoder = HeaderEncoder::new();
        let mut n = 0u32;
        b.iter(|| {
            n = n.wrapping_add(1);
            let reserved = table
                .try_reserve(remote.max_concurrent_streams(), 65535, 65535)
                .map(|stream| {
                    let _ = stream.apply(StreamEvent::SendPushPromise);
                    stream.id()
                });
            let promised = match reserved {
                Ok(id) => id,
                Err(_) => {
                    table = StreamTable::new(Role::Responder);
                    return;
                }
            };
            let headers = request_headers(if n % 2 == 0 { "/style.css" } else { "/app.js" });
            if let Ok(block) = encoder.encode(&headers) {
                black_box(codec::serialize_push_promise(1, promised, &block, remote.max_frame_size()));
            }
            table.remove(promised);
        });
    });
}

// ========== Benchmark Groups ==========

criterion_group! {
    name = frames;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(500);
    targets =
        bench_frame_serialize,
        bench_frame_parse,
        bench_header_block_split
}

criterion_group! {
    name = stream_management;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(500);
    targets =
        bench_stream_transitions,
        bench_stream_table,
        bench_flow_control
}

criterion_group! {
    name = hpack;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(500);
    targets = bench_hpack
}

criterion_group! {
    name = push;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(500);
    targets = bench_push_reservation
}

criterion_main!(frames, stream_management, hpack, push);
