//! Concurrency tests: the catchup/follow handover, parallel subscribers and
//! competing locked attempts.

use factcast::{
    AbortReason, AttemptError, ChannelObserver, Fact, FactInput, FactSpec, FactStore,
    IntermediatePublishResult, Serial, StoreConfig, SubscriptionError, SubscriptionEvent,
    SubscriptionObserver, SubscriptionRequest,
};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_store(page_size: usize) -> Arc<FactStore> {
    init_tracing();
    Arc::new(
        FactStore::in_memory(StoreConfig {
            page_size,
            ..Default::default()
        })
        .unwrap(),
    )
}

fn fact(ns: &str, i: usize) -> FactInput {
    FactInput::new(ns, "T", json!({ "i": i }))
}

fn collect_facts(events: &Receiver<SubscriptionEvent>, n: usize) -> Vec<Fact> {
    let deadline = Instant::now() + WAIT;
    let mut facts = Vec::new();
    while facts.len() < n {
        match events.recv_deadline(deadline) {
            Ok(SubscriptionEvent::Fact(f)) => facts.push(f),
            Ok(SubscriptionEvent::Error(e)) => panic!("subscription failed: {e}"),
            Ok(_) => {}
            Err(_) => break,
        }
    }
    facts
}

/// Publishes one more fact while the last historical fact is being delivered.
struct PublishOnSerial {
    store: Arc<FactStore>,
    trigger: Serial,
    inner: ChannelObserver,
}

impl SubscriptionObserver for PublishOnSerial {
    fn on_next(&self, fact: Fact) {
        if fact.serial == self.trigger {
            self.store
                .publish(vec![FactInput::new("a", "T", json!({ "late": true }))])
                .unwrap();
        }
        self.inner.on_next(fact);
    }

    fn on_catchup(&self) {
        self.inner.on_catchup();
    }

    fn on_error(&self, error: SubscriptionError) {
        self.inner.on_error(error);
    }
}

#[test]
fn test_fact_committed_during_catchup_delivered_exactly_once() {
    for page_size in [7, 100, 1_000] {
        let store = test_store(page_size);
        for i in 0..100 {
            store.publish(vec![fact("a", i)]).unwrap();
        }

        let (inner, events) = ChannelObserver::new();
        let observer = PublishOnSerial {
            store: Arc::clone(&store),
            trigger: Serial(100),
            inner,
        };
        let sub = store
            .subscribe(
                SubscriptionRequest::follow(vec![FactSpec::ns("a")]),
                Arc::new(observer),
            )
            .unwrap();

        let facts = collect_facts(&events, 101);
        assert_eq!(facts.len(), 101, "page size {page_size}");
        assert_eq!(facts[100].serial, Serial(101));
        assert_eq!(facts[100].payload["late"], true);

        // Nothing delivered twice.
        store.publish(vec![fact("a", 999)]).unwrap();
        let more = collect_facts(&events, 1);
        assert_eq!(more.len(), 1);
        assert_eq!(more[0].serial, Serial(102));
        thread::sleep(Duration::from_millis(50));
        assert!(events
            .try_iter()
            .all(|e| !matches!(e, SubscriptionEvent::Fact(_))));

        sub.close();
    }
}

#[test]
fn test_parallel_subscribers_see_every_fact_in_order() {
    let store = test_store(16);
    for i in 0..50 {
        store.publish(vec![fact("a", i)]).unwrap();
    }

    let mut subscribers = Vec::new();
    for _ in 0..4 {
        let (observer, events) = ChannelObserver::new();
        let sub = store
            .subscribe(
                SubscriptionRequest::follow(vec![FactSpec::ns("a")]),
                Arc::new(observer),
            )
            .unwrap();
        subscribers.push((sub, events));
    }

    let publisher = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for i in 50..200 {
                store.publish(vec![fact("a", i), fact("b", i)]).unwrap();
            }
        })
    };
    publisher.join().unwrap();

    for (sub, events) in &subscribers {
        let facts = collect_facts(events, 200);
        assert_eq!(facts.len(), 200);
        assert!(facts.windows(2).all(|w| w[0].serial < w[1].serial));
        let ids: HashSet<_> = facts.iter().map(|f| f.id).collect();
        assert_eq!(ids.len(), 200);
        assert!(facts.iter().all(|f| f.ns == "a"));
        sub.close();
    }
}

#[test]
fn test_competing_attempts_never_lose_updates() {
    let store = test_store(100);
    let committed = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let workers: Vec<_> = (0..8)
        .map(|w| {
            let store = Arc::clone(&store);
            let committed = Arc::clone(&committed);
            let conflicts = Arc::clone(&conflicts);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                for i in 0..10 {
                    let op = store.lock(vec![FactSpec::ns("counter")]).unwrap();
                    let observed = op.observed();
                    match op.attempt(|| {
                        Ok(Some(IntermediatePublishResult::publish(vec![fact(
                            "counter",
                            w * 100 + i,
                        )])))
                    }) {
                        Ok(result) => {
                            committed.fetch_add(1, Ordering::SeqCst);
                            seen.lock().push((observed, result.published[0].serial));
                        }
                        Err(AttemptError::Aborted(AbortReason::ConcurrentModification { .. })) => {
                            conflicts.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => panic!("unexpected error {e}"),
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let committed = committed.load(Ordering::SeqCst);
    assert_eq!(committed + conflicts.load(Ordering::SeqCst), 80);
    assert_eq!(store.current_max_serial().unwrap().0 as usize, committed);

    // Every successful writer had seen the fact right before its own.
    for (observed, written) in seen.lock().iter() {
        assert_eq!(observed.next(), *written);
    }
}

#[test]
fn test_disjoint_namespaces_do_not_conflict() {
    let store = test_store(100);
    let workers: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|ns| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..20 {
                    store
                        .lock(vec![FactSpec::ns(ns)])
                        .unwrap()
                        .optimistic_from(
                            store
                                .storage()
                                .range_scan(
                                    &[FactSpec::ns(ns)],
                                    Serial::ZERO,
                                    usize::MAX,
                                    factcast::RowShape::HeaderOnly,
                                )
                                .unwrap()
                                .facts
                                .last()
                                .map_or(Serial::ZERO, |f| f.serial),
                        )
                        .attempt(|| Ok(Some(IntermediatePublishResult::publish(vec![fact(ns, i)]))))
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(store.current_max_serial().unwrap().0, 80);
}
