use std::thread;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use perfcapd::frame::codec::{
    pack_i32, pack_i64, unpack_i32, unpack_i64, MAXSIZE_PACK32, MAXSIZE_PACK64,
};
use perfcapd::frame::{frame_ring, PerfAttrsWriter};
use perfcapd::perf::PerfEventAttr;

fn bench_codec(c: &mut Criterion) {
    c.bench_function("codec/pack_i32", |b| {
        let mut buf = [0u8; MAXSIZE_PACK32];
        b.iter(|| pack_i32(black_box(-123_456), &mut buf))
    });

    c.bench_function("codec/pack_i64", |b| {
        let mut buf = [0u8; MAXSIZE_PACK64];
        b.iter(|| pack_i64(black_box(0x1234_5678_9abc_def0), &mut buf))
    });

    c.bench_function("codec/unpack_roundtrip", |b| {
        let mut buf = [0u8; MAXSIZE_PACK64];
        let len = pack_i64(-987_654_321_012, &mut buf);
        b.iter(|| {
            let (v, _) = unpack_i64(black_box(&buf[..len])).expect("decodes");
            let mut out = [0u8; MAXSIZE_PACK64];
            pack_i64(v, &mut out)
        })
    });

    c.bench_function("codec/unpack_i32_small", |b| {
        let mut buf = [0u8; MAXSIZE_PACK32];
        let len = pack_i32(42, &mut buf);
        b.iter(|| unpack_i32(black_box(&buf[..len])).expect("decodes"))
    });
}

fn bench_marshal(c: &mut Criterion) {
    // Steady-state marshaling with a live consumer draining the ring, so
    // the numbers include the back-pressure machinery.
    let (ring, consumer) = frame_ring(1024 * 1024);
    let drain = thread::spawn(move || {
        let mut bytes = 0u64;
        while let Some(frame) = consumer.read_frame() {
            bytes += frame.len() as u64;
        }
        bytes
    });

    let mut writer = PerfAttrsWriter::new(ring);

    let mut attr = PerfEventAttr::new();
    attr._type = 1;
    attr.config = 9;
    attr.sample_period = 1_000_000;

    c.bench_function("marshal/pea", |b| {
        b.iter(|| writer.marshal_pea(black_box(&attr), black_box(7)))
    });

    let ids: Vec<u64> = (0..16).map(|i| 0x1000 + i).collect();
    let keys: Vec<i32> = (0..16).collect();
    c.bench_function("marshal/keys_16", |b| {
        b.iter(|| writer.marshal_keys(black_box(&ids), black_box(&keys)))
    });

    c.bench_function("marshal/counters_8", |b| {
        b.iter(|| {
            writer.perf_counter_header(black_box(123_456_789), 8);
            for core in 0..8 {
                writer.perf_counter(core, core + 10, 1_000_000 + i64::from(core));
            }
            writer.perf_counter_footer();
        })
    });

    drop(writer);
    let drained = drain.join().expect("drain thread");
    assert!(drained > 0);
}

fn bench_suite(c: &mut Criterion) {
    bench_codec(c);
    bench_marshal(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
