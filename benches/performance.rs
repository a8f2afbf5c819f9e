//! Performance benchmarks for the fact store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use factcast::{
    matches_any, ChannelObserver, FactInput, FactSpec, FactStore, IntermediatePublishResult,
    Serial, StoreConfig, SubscriptionRequest,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn create_store(page_size: usize) -> FactStore {
    FactStore::in_memory(StoreConfig {
        page_size,
        ..Default::default()
    })
    .unwrap()
}

/// Benchmark bounded catchup over logs of varying length
fn bench_catchup(c: &mut Criterion) {
    let mut group = c.benchmark_group("catchup");
    group.sample_size(20);

    for facts in [1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("facts", facts), &facts, |b, &facts| {
            let store = create_store(1_000);
            for chunk in (0..facts).collect::<Vec<_>>().chunks(500) {
                store
                    .publish(
                        chunk
                            .iter()
                            .map(|i| {
                                let ns = if i % 2 == 0 { "even" } else { "odd" };
                                FactInput::new(ns, "Tick", json!({ "i": i }))
                            })
                            .collect(),
                    )
                    .unwrap();
            }

            b.iter(|| {
                let (observer, events) = ChannelObserver::new();
                let sub = store
                    .subscribe(
                        SubscriptionRequest::catchup(vec![FactSpec::ns("even")]),
                        Arc::new(observer),
                    )
                    .unwrap();
                sub.await_complete(Duration::from_secs(60));
                black_box(events.try_iter().count());
            });
        });
    }

    group.finish();
}

/// Benchmark spec matching with and without a filter script
fn bench_matcher(c: &mut Criterion) {
    let mut group = c.benchmark_group("matcher");

    let agg = Uuid::new_v4();
    let fact = FactInput::new("orders", "Placed", json!({ "total": 42, "country": "AT" }))
        .with_aggregate_id(agg)
        .with_meta("region", "eu")
        .into_fact(Serial(1));

    let header_only = vec![
        FactSpec::ns("users"),
        FactSpec::ns("orders")
            .fact_type("Placed")
            .aggregate_id(agg)
            .meta("region", "eu"),
    ];
    let scripted = vec![FactSpec::ns("orders")
        .fact_type("Placed")
        .filter_script("payload.total > 10 && payload.country in ['DE', 'AT']")];

    group.bench_function("header", |b| {
        b.iter(|| black_box(matches_any(&fact, &header_only).unwrap()))
    });
    group.bench_function("script", |b| {
        b.iter(|| black_box(matches_any(&fact, &scripted).unwrap()))
    });

    group.finish();
}

/// Benchmark plain and locked publishing
fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");

    group.bench_function("plain", |b| {
        let store = create_store(1_000);
        b.iter(|| {
            store
                .publish(vec![FactInput::new("a", "T", json!({ "v": 1 }))])
                .unwrap()
        })
    });

    group.bench_function("locked_attempt", |b| {
        let store = create_store(1_000);
        b.iter(|| {
            store
                .lock(vec![FactSpec::ns("a")])
                .unwrap()
                .attempt(|| {
                    Ok(Some(IntermediatePublishResult::publish(vec![FactInput::new(
                        "a",
                        "T",
                        json!({ "v": 1 }),
                    )])))
                })
                .unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_catchup, bench_matcher, bench_publish);
criterion_main!(benches);
