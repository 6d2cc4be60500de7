//! Channel throughput benchmark.
//!
//! Measures frame codec cost, envelope encoding per wire format and the
//! latency of a full request/response over an in-memory channel pair.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hostmesh::ipc::codec::{read_frame, write_frame};
use hostmesh::ipc::message::{CallBody, Envelope, Invocation};
use hostmesh::ipc::{Channel, WireFormat};
use hostmesh::types::ChannelConfig;
use hostmesh::EndpointAddress;
use serde_json::json;
use std::io::Cursor;

const MAX_FRAME: u32 = 16 * 1024 * 1024;

fn bench_write_frame(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let payload_sizes: &[usize] = &[0, 64, 1024, 4096, 65536];

    let mut group = c.benchmark_group("write_frame");
    for &size in payload_sizes {
        let payload = vec![0xABu8; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, p| {
            b.iter(|| {
                rt.block_on(async {
                    let mut buf = Vec::with_capacity(size + 4);
                    write_frame(&mut buf, black_box(p)).await.unwrap();
                    buf
                })
            });
        });
    }
    group.finish();
}

fn bench_read_frame(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let payload_sizes: &[usize] = &[0, 64, 1024, 4096, 65536];

    let mut group = c.benchmark_group("read_frame");
    for &size in payload_sizes {
        // Pre-build the wire frame
        let payload = vec![0xABu8; size];
        let wire = rt.block_on(async {
            let mut buf = Vec::new();
            write_frame(&mut buf, &payload).await.unwrap();
            buf
        });

        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, w| {
            b.iter(|| {
                rt.block_on(async {
                    let mut cursor = Cursor::new(black_box(w.as_slice()));
                    read_frame(&mut cursor, MAX_FRAME).await.unwrap()
                })
            });
        });
    }
    group.finish();
}

fn bench_encode_request(c: &mut Criterion) {
    let target: EndpointAddress = "localhost/p1/e1".parse().unwrap();
    let body = CallBody::Invoke(Invocation::by_name("Echo", vec![json!({"k": [1, 2, 3]})]));

    let mut group = c.benchmark_group("encode_request");
    for format in [WireFormat::MsgPack, WireFormat::Json] {
        let payload = Bytes::from(format.encode(&body).unwrap());
        let envelope = Envelope::Request {
            call_id: hostmesh::types::CallId::new(1).unwrap(),
            target: target.clone(),
            timeout_ms: Some(1000),
            payload,
        };
        group.bench_with_input(BenchmarkId::from_parameter(format.name()), &envelope, |b, e| {
            b.iter(|| format.encode(black_box(e)).unwrap());
        });
    }
    group.finish();
}

fn bench_call_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = ChannelConfig {
        keepalive_interval: None,
        ..ChannelConfig::default()
    };
    let target: EndpointAddress = "localhost/p1/e1".parse().unwrap();

    let client = rt.block_on(async {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let (near_r, near_w) = tokio::io::split(near);
        let (far_r, far_w) = tokio::io::split(far);
        let (client, _client_inbound) =
            Channel::open(near_r, near_w, &config, WireFormat::MsgPack);
        let (server, mut server_inbound) =
            Channel::open(far_r, far_w, &config, WireFormat::MsgPack);

        // Echo every request payload back as the response.
        tokio::spawn(async move {
            while let Some(envelope) = server_inbound.recv().await {
                if let Envelope::Request {
                    call_id, payload, ..
                } = envelope
                {
                    let _ = server.send(&Envelope::Response { call_id, payload }).await;
                }
            }
        });
        client
    });

    let payload = Bytes::from(vec![0xABu8; 1024]);
    c.bench_function("call_round_trip_1kb", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut pending = client
                    .start_call(target.clone(), None, black_box(payload.clone()))
                    .await
                    .unwrap();
                pending.response().await.unwrap()
            })
        });
    });
}

criterion_group!(
    benches,
    bench_write_frame,
    bench_read_frame,
    bench_encode_request,
    bench_call_round_trip
);
criterion_main!(benches);
