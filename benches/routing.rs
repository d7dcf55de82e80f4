use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mixroute::{field, onion, Cipher};
use rand::prelude::*;

fn bench_field_cipher(c: &mut Criterion) {
    let mut group = c.benchmark_group("field_cipher");
    let mut rng = thread_rng();

    let mut key = vec![0u8; field::PRIME_LENGTH - 1];
    rng.fill_bytes(&mut key);
    let keys = vec![key];

    for size in [1024usize, 8 * 1024, 64 * 1024] {
        // Pay the root-table warm-up outside the measurement.
        field::warm_roots(size / field::PRIME_LENGTH + 1);

        let msg = vec![0u8; size];
        let cipher = Cipher::start(&mut rng, &keys, &msg).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("cycle", size), &size, |b, _| {
            b.iter(|| {
                let mut cipher = cipher.clone();
                cipher.cycle(&mut thread_rng(), &keys[0]).unwrap();
                black_box(cipher)
            })
        });
    }
    group.finish();
}

fn bench_onion(c: &mut Criterion) {
    let mut group = c.benchmark_group("onion");
    let mut rng = thread_rng();

    let nodes: Vec<onion::Node> = (0..5)
        .map(|_| onion::Node::generate(&mut rng).unwrap())
        .collect();
    let payload = vec![0u8; 2048];

    let mut sender = onion::SendRouteBuilder::new();
    for node in &nodes {
        sender.push(&mut rng, &node.public()).unwrap();
    }
    group.bench_function("send", |b| {
        b.iter(|| black_box(sender.send(&mut thread_rng(), &payload).unwrap()))
    });

    // Route a receive-direction hop; it has no replay bookkeeping, so the
    // same package can be unwrapped repeatedly.
    let owner = onion::Node::generate(&mut rng).unwrap();
    let mut receive = owner.receive_route(&mut rng).unwrap();
    for node in &nodes {
        receive.push(&mut rng, &node.public()).unwrap();
    }
    let (_, _, published) = receive.receive(&mut rng).unwrap();
    let pkg = published.send(&mut rng, &payload).unwrap();
    let entry = nodes.last().unwrap();

    group.bench_function("route", |b| {
        b.iter(|| {
            let mut pkg = pkg.clone();
            entry.route(&mut thread_rng(), &mut pkg).unwrap();
            black_box(pkg)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_field_cipher, bench_onion);
criterion_main!(benches);
