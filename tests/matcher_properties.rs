//! Property tests for fact spec matching.

use factcast::{matches, matches_any, Fact, FactInput, FactSpec, Serial};
use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

const NAMESPACES: &[&str] = &["users", "orders", "billing"];
const TYPES: &[&str] = &["Created", "Updated", "Deleted"];
const REGIONS: &[&str] = &["eu", "us", "apac"];

fn aggregates() -> Vec<Uuid> {
    (1..=3u128).map(Uuid::from_u128).collect()
}

prop_compose! {
    fn arb_fact()(
        ns in 0..NAMESPACES.len(),
        ty in 0..TYPES.len(),
        version in 1u32..4,
        aggs in proptest::sample::subsequence((1..=3u128).collect::<Vec<_>>(), 0..=3),
        region in proptest::option::of(0..REGIONS.len()),
        amount in -100i64..100,
    ) -> Fact {
        let mut input = FactInput::new(NAMESPACES[ns], TYPES[ty], json!({ "amount": amount }))
            .with_version(version);
        for agg in aggs {
            input = input.with_aggregate_id(Uuid::from_u128(agg));
        }
        if let Some(r) = region {
            input = input.with_meta("region", REGIONS[r]);
        }
        input.into_fact(Serial(1))
    }
}

prop_compose! {
    fn arb_spec()(
        ns in 0..NAMESPACES.len(),
        ty in proptest::option::of(0..TYPES.len()),
        version in 0u32..4,
        agg in proptest::option::of(0..3usize),
        region in proptest::option::of(0..REGIONS.len()),
        region_exists in proptest::option::of(any::<bool>()),
        threshold in proptest::option::of(-100i64..100),
    ) -> FactSpec {
        let mut spec = FactSpec::ns(NAMESPACES[ns]).version(version);
        if let Some(t) = ty {
            spec = spec.fact_type(TYPES[t]);
        }
        if let Some(a) = agg {
            spec = spec.aggregate_id(aggregates()[a]);
        }
        if let Some(r) = region {
            spec = spec.meta("region", REGIONS[r]);
        }
        if let Some(exists) = region_exists {
            spec = spec.meta_key_exists("region", exists);
        }
        if let Some(t) = threshold {
            spec = spec.filter_script(format!("payload.amount >= {t}"));
        }
        spec
    }
}

proptest! {
    #[test]
    fn prop_specs_are_ored(fact in arb_fact(), specs in proptest::collection::vec(arb_spec(), 0..5)) {
        let any = specs.iter().any(|s| matches(&fact, s).unwrap());
        prop_assert_eq!(matches_any(&fact, &specs).unwrap(), any);
    }

    #[test]
    fn prop_constraints_only_narrow(fact in arb_fact(), spec in arb_spec(), region in 0..REGIONS.len()) {
        let narrowed = spec.clone().meta("region", REGIONS[region]);
        if matches(&fact, &narrowed).unwrap() {
            prop_assert!(matches(&fact, &spec).unwrap());
        }
    }

    #[test]
    fn prop_namespace_is_always_required(fact in arb_fact(), spec in arb_spec()) {
        if spec.ns != fact.ns {
            prop_assert!(!matches(&fact, &spec).unwrap());
        }
    }

    #[test]
    fn prop_version_zero_is_wildcard(fact in arb_fact(), spec in arb_spec()) {
        let any_version = spec.clone().version(0);
        let exact = spec.version(fact.version);
        prop_assert_eq!(matches(&fact, &any_version).unwrap(), matches(&fact, &exact).unwrap());
    }
}
