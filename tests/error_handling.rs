//! Error handling and edge case tests.

use factcast::{
    AdvisoryWriteLock, AttemptAborted, ChannelObserver, FactCastError, FactInput, FactSpec,
    FactStore, LockScope, MatchError, StoreConfig, SubscriptionError, SubscriptionEvent,
    SubscriptionRequest, SubscriptionState, TransformationError,
};
use crossbeam_channel::Receiver;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn test_store() -> FactStore {
    FactStore::in_memory(StoreConfig {
        lock_timeout_ms: 50,
        ..Default::default()
    })
    .unwrap()
}

fn fact(ns: &str) -> FactInput {
    FactInput::new(ns, "T", json!({"n": 1}))
}

/// Wait for the terminal error of a subscription.
fn terminal_error(events: &Receiver<SubscriptionEvent>) -> (usize, SubscriptionError) {
    let mut delivered = 0;
    loop {
        match events.recv_timeout(WAIT) {
            Ok(SubscriptionEvent::Fact(_)) => delivered += 1,
            Ok(SubscriptionEvent::Error(e)) => return (delivered, e),
            Ok(other) => panic!("expected an error, got {other:?}"),
            Err(_) => panic!("no error reported"),
        }
    }
}

// --- Publishing ---

#[test]
fn test_duplicate_fact_id_rejected_atomically() {
    let store = test_store();
    let id = Uuid::new_v4();
    store.publish(vec![fact("a").with_id(id)]).unwrap();

    let result = store.publish(vec![fact("a"), fact("a").with_id(id)]);
    assert!(matches!(result, Err(FactCastError::DuplicateFactId(d)) if d == id));
    assert_eq!(store.current_max_serial().unwrap().0, 1);
}

#[test]
fn test_invalid_fact_rejected() {
    let store = test_store();
    assert!(matches!(
        store.publish(vec![fact("")]),
        Err(FactCastError::InvalidFact(_))
    ));
    assert!(matches!(
        store.publish(vec![fact("a").with_version(0)]),
        Err(FactCastError::InvalidFact(_))
    ));
}

#[test]
fn test_lock_timeout_is_surfaced() {
    let store = test_store();
    let blocker = AdvisoryWriteLock::new(store.storage().clone(), Duration::from_secs(1));
    let guard = blocker.acquire(&LockScope::Global).unwrap();

    let result = store.publish(vec![fact("a")]);
    assert!(matches!(result, Err(FactCastError::LockTimeout { .. })));

    let attempt = store
        .lock(vec![FactSpec::ns("a")])
        .unwrap()
        .attempt(|| Err(AttemptAborted::with_reason("never reached")));
    assert!(matches!(
        attempt,
        Err(factcast::AttemptError::Store(FactCastError::LockTimeout { .. }))
    ));

    drop(guard);
    assert!(store.publish(vec![fact("a")]).is_ok());
}

#[test]
fn test_lock_without_specs_rejected() {
    let store = test_store();
    assert!(matches!(
        store.lock(vec![]),
        Err(FactCastError::InvalidRequest(_))
    ));
}

// --- Subscriptions ---

#[test]
fn test_unknown_start_id() {
    let store = test_store();
    let (observer, _events) = ChannelObserver::new();
    let result = store.subscribe(
        SubscriptionRequest::catchup(vec![FactSpec::ns("a")]).after_id(Uuid::new_v4()),
        Arc::new(observer),
    );
    assert!(matches!(result, Err(FactCastError::UnknownStartId(_))));
}

#[test]
fn test_broken_script_is_terminal() {
    let store = test_store();
    store.publish(vec![fact("a")]).unwrap();

    let (observer, events) = ChannelObserver::new();
    let sub = store
        .subscribe(
            SubscriptionRequest::follow(vec![FactSpec::ns("a").filter_script("payload.n ==")]),
            Arc::new(observer),
        )
        .unwrap();

    let (delivered, error) = terminal_error(&events);
    assert_eq!(delivered, 0);
    assert!(matches!(error, SubscriptionError::Match(MatchError::Compile { .. })));
    assert!(!sub.await_catchup(Duration::from_millis(100)));
    assert_eq!(sub.state(), SubscriptionState::Failed);
}

#[test]
fn test_script_runtime_failure_is_not_a_non_match() {
    let store = test_store();
    store
        .publish(vec![
            FactInput::new("a", "T", json!({"n": 1})),
            FactInput::new("a", "T", json!({"n": "one"})),
            FactInput::new("a", "T", json!({"n": 3})),
        ])
        .unwrap();

    let (observer, events) = ChannelObserver::new();
    let _sub = store
        .subscribe(
            SubscriptionRequest::catchup(vec![FactSpec::ns("a").filter_script("payload.n > 0")]),
            Arc::new(observer),
        )
        .unwrap();

    let (delivered, error) = terminal_error(&events);
    assert_eq!(delivered, 1);
    assert!(matches!(error, SubscriptionError::Match(MatchError::Evaluation { .. })));
}

#[test]
fn test_missing_transformation_is_terminal() {
    let store = test_store();
    store.publish(vec![fact("a")]).unwrap();

    let (observer, events) = ChannelObserver::new();
    let sub = store
        .subscribe(
            SubscriptionRequest::catchup(vec![FactSpec::ns("a").fact_type("T").version(4)]),
            Arc::new(observer),
        )
        .unwrap();

    let (delivered, error) = terminal_error(&events);
    assert_eq!(delivered, 0);
    match error {
        SubscriptionError::Transformation { source, .. } => match source {
            TransformationError::MissingTransformationInformation { key, from, to } => {
                assert_eq!(key.ns, "a");
                assert_eq!(key.fact_type, "T");
                assert_eq!((from, to), (1, 4));
            }
            other => panic!("unexpected {other:?}"),
        },
        other => panic!("unexpected {other:?}"),
    }
    assert!(!sub.await_complete(Duration::from_millis(100)));
}

#[test]
fn test_fetch_missing_fact() {
    let store = test_store();
    assert!(store.fetch_by_id(Uuid::new_v4()).unwrap().is_none());
    assert!(store
        .fetch_by_id_in_version(Uuid::new_v4(), 3)
        .unwrap()
        .is_none());
}

#[test]
fn test_fetch_in_missing_version_reports_transformation_error() {
    let store = test_store();
    let published = store.publish(vec![fact("a")]).unwrap();

    let error = store.fetch_by_id_in_version(published[0].id, 3).unwrap_err();
    assert!(error.to_string().starts_with("Missing transformation information"));
    match error {
        FactCastError::Transformation(inner) => assert!(matches!(
            *inner,
            TransformationError::MissingTransformationInformation { from: 1, to: 3, .. }
        )),
        other => panic!("unexpected {other:?}"),
    }
}
