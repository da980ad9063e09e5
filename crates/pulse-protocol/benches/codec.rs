//! Codec benchmarks for pulse-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use pulse_protocol::{Frame, JsonSerializer, MsgPackSerializer, Serializer};
use serde_json::json;

fn sample_frame(body_len: usize) -> Frame {
    Frame::new(
        "room:lobby",
        "new_msg",
        json!({ "body": "x".repeat(body_len), "user": "u1" }),
    )
    .with_ref("42")
    .with_join_ref("1")
}

fn bench_encode(c: &mut Criterion) {
    let frame = sample_frame(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("json_64B", |b| {
        b.iter(|| JsonSerializer.encode(black_box(&frame)))
    });
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| MsgPackSerializer.encode(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let frame = sample_frame(64);
    let json = JsonSerializer.encode(&frame).unwrap();
    let msgpack = MsgPackSerializer.encode(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(json.len() as u64));
    group.bench_function("json_64B", |b| {
        b.iter(|| JsonSerializer.decode(black_box(&json)))
    });
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| MsgPackSerializer.decode(black_box(&msgpack)))
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let frame = sample_frame(256);

    c.bench_function("json_roundtrip_256B", |b| {
        b.iter(|| {
            let encoded = JsonSerializer.encode(black_box(&frame)).unwrap();
            JsonSerializer.decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_roundtrip);
criterion_main!(benches);
