//! Throughput benchmarks for Ferrobus.
//!
//! These benchmarks measure the raw message throughput of various components.

use bus_protocol::names::{BUS_NAME, BUS_PATH};
use bus_protocol::{codec, Message};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ferrobus_core::{Admission, Router};

fn call(payload: usize) -> Message {
    Message::method_call("com.example.Foo", "/com/example/Foo", "Ping")
        .with_serial(1)
        .with_sender(":2")
        .with_arg(vec![0u8; payload])
}

fn drain(admission: &mut Admission) {
    while admission.outbound.try_recv().is_ok() {}
}

/// Benchmark message encoding.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [64usize, 1024, 65536] {
        let message = call(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            b.iter(|| codec::encode(black_box(message)))
        });
    }

    group.finish();
}

/// Benchmark message decoding.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for size in [64usize, 1024, 65536] {
        let encoded = codec::encode(&call(size)).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| codec::decode(black_box(encoded)))
        });
    }

    group.finish();
}

/// Benchmark router operations.
fn bench_router(c: &mut Criterion) {
    let mut group = c.benchmark_group("router");

    group.bench_function("hello", |b| {
        let router = Router::new();
        let mut conn = router.admit().unwrap();
        let hello = Message::method_call(BUS_NAME, BUS_PATH, "Hello").with_serial(1);

        b.iter(|| {
            router.route(conn.id, black_box(&hello));
            drain(&mut conn);
        });
    });

    group.bench_function("request_release_name", |b| {
        let router = Router::new();
        let mut conn = router.admit().unwrap();
        let request = Message::method_call(BUS_NAME, BUS_PATH, "RequestName").with_arg("com.example.Foo");
        let release = Message::method_call(BUS_NAME, BUS_PATH, "ReleaseName").with_arg("com.example.Foo");

        b.iter(|| {
            router.route(conn.id, black_box(&request));
            router.route(conn.id, black_box(&release));
            drain(&mut conn);
        });
    });

    // Proxied call plus its reply
    group.bench_function("call_and_reply", |b| {
        let router = Router::new();
        let mut service = router.admit().unwrap();
        let mut caller = router.admit().unwrap();
        let request = Message::method_call(BUS_NAME, BUS_PATH, "RequestName").with_arg("com.example.Foo");
        router.route(service.id, &request);
        drain(&mut service);

        let ping = call(64).with_sender(caller.unique_name.clone());

        b.iter(|| {
            router.route(caller.id, black_box(&ping));
            if let Ok(forwarded) = service.outbound.try_recv() {
                router.route(service.id, &forwarded.method_return());
            }
            drain(&mut caller);
        });
    });

    group.finish();
}

/// Benchmark broadcast fan-out.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for size in [10usize, 100, 1000, 10000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let router = Router::new();
            let mut conns: Vec<_> = (0..size).map(|_| router.admit().unwrap()).collect();
            let signal = Message::signal("/com/example", "com.example.Iface", "Changed").with_serial(1);
            let origin = conns[0].id;

            b.iter(|| {
                router.route(origin, black_box(&signal));
                for conn in &mut conns {
                    drain(conn);
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_router, bench_fanout);
criterion_main!(benches);
