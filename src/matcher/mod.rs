//! Deciding whether a fact satisfies a subscription's filter.
//!
//! A [`FactSpec`](crate::types::FactSpec) constrains namespace, type,
//! version, aggregate ids, metadata and optionally a filter script. Specs of
//! one request are ORed, the fields of one spec are ANDed. Script failures
//! are errors, never silent non-matches.

mod expr;
mod script;
mod spec;

pub use expr::{Expression, ExpressionCompiler};
pub use script::{ScriptCompiler, ScriptEngine, ScriptPredicate, DEFAULT_SCRIPT_CACHE_SIZE};
pub use spec::{matches, matches_any, FactSpecMatcher, FactSpecsMatcher, VersionMatch};
