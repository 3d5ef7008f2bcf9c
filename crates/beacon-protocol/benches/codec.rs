//! Codec benchmarks for beacon-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use beacon_protocol::{codec, ClientInfo, Envelope, EnvelopeKind, Message};

fn sample_message(size: usize) -> Message {
    let body = format!("{{\"text\":\"{}\"}}", "x".repeat(size));
    Message::new("chat:lobby", body.as_bytes())
        .with_client("conn-1")
        .with_info(Some(ClientInfo::new("42", "conn-1", None, None)))
}

fn bench_encode_json(c: &mut Criterion) {
    let msg = sample_message(64);

    let mut group = c.benchmark_group("encode_json");
    group.throughput(Throughput::Bytes(msg.payload_size() as u64));
    group.bench_function("small_64B", |b| b.iter(|| codec::encode_json(black_box(&msg))));
    group.finish();
}

fn bench_decode_json(c: &mut Criterion) {
    let encoded = codec::encode_json(&sample_message(64)).unwrap();

    let mut group = c.benchmark_group("decode_json");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::decode_json::<Message>(black_box(&encoded)))
    });
    group.finish();
}

fn bench_envelope_roundtrip(c: &mut Criterion) {
    let msg = sample_message(256);

    c.bench_function("envelope_roundtrip_256B", |b| {
        b.iter(|| {
            let envelope =
                Envelope::wrap(EnvelopeKind::Message, "beacon.message.chat:lobby", black_box(&msg))
                    .unwrap();
            let encoded = codec::encode(&envelope).unwrap();
            codec::decode(black_box(&encoded)).unwrap().open::<Message>().unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_json,
    bench_decode_json,
    bench_envelope_roundtrip
);
criterion_main!(benches);
