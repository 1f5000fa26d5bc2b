//! Delivery throughput benchmarks for the listener container.

use change_listener::{
    ChangeFilter, ChangeListenerContainer, ChangeStreamRequest, Criterion as Where, MappingContext,
    MemoryChangeSource, OperationType,
};
use crossbeam_channel::unbounded;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(30);

/// Benchmark end-to-end delivery of inserts through one subscription
fn bench_delivery(c: &mut Criterion) {
    let mut group = c.benchmark_group("delivery");

    for batch in [100u64, 1_000, 5_000] {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::new("inserts", batch), &batch, |b, &batch| {
            let source = MemoryChangeSource::new();
            let container = ChangeListenerContainer::new(source.clone(), MappingContext::new());
            let (tx, rx) = unbounded();
            let request = ChangeStreamRequest::<Value>::from_fn(move |event| {
                let _ = tx.send(event.resume_token());
                Ok(())
            })
            .collection("bench")
            .build();
            let subscription = container.register(request).unwrap();
            subscription.await_active(WAIT);

            b.iter(|| {
                for i in 0..batch {
                    source.save("bench", &json!({ "n": i })).unwrap();
                }
                for _ in 0..batch {
                    black_box(rx.recv_timeout(WAIT).unwrap());
                }
            });
        });
    }

    group.finish();
}

/// Benchmark filter evaluation on a change record
fn bench_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");
    let document = json!({
        "operationType": "insert",
        "ns": { "coll": "person" },
        "fullDocument": { "firstname": "Ash", "age": 35, "address": { "city": "Seattle" } }
    });

    let filters = [
        ("wildcard", ChangeFilter::all()),
        (
            "operation_type",
            ChangeFilter::operation_types([OperationType::Insert, OperationType::Replace]),
        ),
        (
            "nested_fields",
            ChangeFilter::operation_types([OperationType::Insert])
                .and(Where::gte("fullDocument.age", 30))
                .and(Where::is("fullDocument.address.city", "Seattle")),
        ),
    ];

    for (name, filter) in filters {
        group.bench_function(name, |b| {
            b.iter(|| black_box(filter.matches_document(black_box(&document))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_delivery, bench_filter);
criterion_main!(benches);
