//! Criterion benchmarks for the GroupLink envelope codec.
//!
//! The SyncSet cases matter most: the coordinator encodes one per accepted
//! Join, and its size grows with the group.
//!
//! Run with:
//! ```bash
//! cargo bench --package grouplink-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use grouplink_core::{decode_envelope, encode_envelope, Device, Envelope};

// ── Envelope fixtures ─────────────────────────────────────────────────────────

fn coordinator() -> Device {
    Device::new("02:00:00:00:00:01", "coordinator")
}

fn member(n: usize) -> Device {
    Device::new(format!("02:00:00:00:01:{n:02x}"), format!("member-{n}"))
        .with_endpoint(format!("192.168.49.{}:{}", 10 + n % 200, 40000 + n).parse().unwrap())
}

fn make_join() -> Envelope {
    let m = member(1);
    Envelope::join(&m, &m).expect("join fixture")
}

fn make_sync_set(size: usize) -> Envelope {
    let devices: Vec<Device> = (0..size).map(member).collect();
    Envelope::sync_set(&coordinator(), &devices).expect("sync set fixture")
}

fn make_data(len: usize) -> Envelope {
    Envelope::data(&member(2), vec![0x5A; len])
}

fn fixtures() -> Vec<(&'static str, Envelope)> {
    vec![
        ("Join", make_join()),
        ("SyncSet(8)", make_sync_set(8)),
        ("SyncSet(64)", make_sync_set(64)),
        ("Data(32B)", make_data(32)),
        ("Data(64KiB)", make_data(64 * 1024)),
    ]
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

/// Benchmarks `encode_envelope` for representative envelopes.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_envelope");
    for (name, envelope) in fixtures() {
        group.bench_with_input(BenchmarkId::new("envelope", name), &envelope, |b, envelope| {
            b.iter(|| encode_envelope(black_box(envelope)).expect("encode must succeed"))
        });
    }
    group.finish();
}

/// Benchmarks `decode_envelope`, including typed payload validation.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_envelope");
    for (name, envelope) in fixtures() {
        let bytes = encode_envelope(&envelope).expect("encode must succeed for benchmark setup");
        group.bench_with_input(BenchmarkId::new("envelope", name), &bytes, |b, bytes| {
            b.iter(|| decode_envelope(black_box(bytes)).expect("decode must succeed"))
        });
    }
    group.finish();
}

/// Benchmarks reading the device list back out of a decoded SyncSet.
fn bench_sync_set_devices(c: &mut Criterion) {
    let envelope = make_sync_set(64);
    c.bench_function("sync_set_devices_64", |b| {
        b.iter(|| black_box(&envelope).devices().expect("devices must decode"))
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_sync_set_devices);
criterion_main!(benches);
