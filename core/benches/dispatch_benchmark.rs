/// Dispatch and codec benchmarks using Criterion
///
/// Run with: cargo bench --bench dispatch_benchmark
///
/// Benchmarks cover:
/// - Request/response through trees of increasing depth
/// - Fan-out through a topic
/// - Frame encode/decode with and without binary payloads
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use arbor_core::codec;
use arbor_core::{Address, Dispatcher, Event, Node, Payload};
use bytes::Bytes;

fn chain_of(depth: usize) -> (Dispatcher, Address) {
    let mut dispatcher = Dispatcher::new();
    dispatcher.set_root(Node::new(), Address::new(["root"]).unwrap());
    let mut parent = Address::new(["root"]).unwrap();
    for level in 0..depth {
        let id = format!("n{level}");
        dispatcher.add_child(&parent, id.as_str(), Node::new()).unwrap();
        parent = parent.child(&id).unwrap();
    }
    dispatcher
        .set_listener(&parent, "echo", |event, ctx| {
            let _ = ctx.respond(event, Payload::new("echoResponse"));
        })
        .unwrap();
    (dispatcher, parent)
}

/// Benchmark: chained request answered by the deepest leaf
fn bench_request_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_request_response");

    for depth in [1usize, 4, 16].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, &depth| {
            let (mut dispatcher, leaf) = chain_of(depth);
            let root = Address::new(["root"]).unwrap();
            b.iter(|| {
                dispatcher
                    .chain(&root, leaf.clone(), Payload::new("echo"), |event, _| {
                        black_box(event.is_response);
                    })
                    .unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark: topic fan-out to N subscribers
fn bench_topic_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_topic_fanout");

    for subscribers in [10usize, 100, 1_000].iter() {
        group.throughput(Throughput::Elements(*subscribers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            subscribers,
            |b, &subscribers| {
                let mut dispatcher = Dispatcher::new();
                let root = Address::new(["root"]).unwrap();
                dispatcher.set_root(Node::new(), root.clone());
                dispatcher.add_child(&root, "topic", Node::topic()).unwrap();
                let topic = root.child("topic").unwrap();
                for i in 0..subscribers {
                    let id = format!("s{i}");
                    dispatcher
                        .add_child(&root, id.as_str(), Node::new().with_listener("tick", |_, _| {}))
                        .unwrap();
                    dispatcher
                        .send(&root.child(&id).unwrap(), topic.clone(), Payload::new("subscribe"))
                        .unwrap();
                }
                b.iter(|| {
                    dispatcher
                        .notify(&topic, Payload::new("tick"), &[])
                        .unwrap()
                });
            },
        );
    }
    group.finish();
}

/// Benchmark: wire codec with growing binary payloads
fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_round_trip");

    for size in [0usize, 1_024, 1_048_576].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        let event = Event::new(
            Address::new(["root", "a"]).unwrap(),
            Address::new(["root", "b"]).unwrap(),
            Payload::new("blob").with("raw", Bytes::from(vec![0u8; *size])),
        )
        .unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(size), &event, |b, event| {
            b.iter(|| {
                let frame = codec::encode(black_box(event)).unwrap();
                codec::decode(frame).unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_request_response, bench_topic_fanout, bench_codec);
criterion_main!(benches);
