//! Matching facts against [`FactSpec`]s.

use super::script::{ScriptEngine, ScriptPredicate};
use crate::error::MatchError;
use crate::types::{Fact, FactSpec};
use std::sync::Arc;

/// How a spec's version takes part in matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionMatch {
    /// A non-zero spec version must equal the fact version.
    Exact,
    /// For typed specs the version is a delivery target, not a filter. Facts
    /// of any version match and are transformed before delivery. Untyped
    /// specs still filter on a non-zero version.
    Transformable,
}

/// One compiled spec.
pub struct FactSpecMatcher {
    spec: FactSpec,
    script: Option<Arc<dyn ScriptPredicate>>,
    versions: VersionMatch,
}

impl FactSpecMatcher {
    /// Compile `spec`, resolving its filter script through `engine`.
    pub fn new(
        spec: FactSpec,
        engine: &ScriptEngine,
        versions: VersionMatch,
    ) -> Result<Self, MatchError> {
        let script = match &spec.filter_script {
            Some(source) => Some(engine.predicate(source)?),
            None => None,
        };
        Ok(Self {
            spec,
            script,
            versions,
        })
    }

    pub fn spec(&self) -> &FactSpec {
        &self.spec
    }

    /// Every header constraint, without the script.
    pub fn test_header(&self, fact: &Fact) -> bool {
        let spec = &self.spec;

        if spec.ns != fact.ns {
            return false;
        }
        if let Some(ref fact_type) = spec.fact_type {
            if *fact_type != fact.fact_type {
                return false;
            }
        }
        // Without a type there is no transformation target, so the version filters.
        let exact = self.versions == VersionMatch::Exact || spec.fact_type.is_none();
        if exact && spec.version != 0 && spec.version != fact.version {
            return false;
        }
        if !spec
            .aggregate_ids
            .iter()
            .all(|id| fact.aggregate_ids.contains(id))
        {
            return false;
        }
        if !spec
            .meta
            .iter()
            .all(|(key, value)| fact.meta.contains_value(key, value))
        {
            return false;
        }
        spec.meta_key_exists
            .iter()
            .all(|(key, exists)| fact.meta.contains_key(key) == *exists)
    }

    /// Whether `fact` satisfies every set field of the spec.
    pub fn test(&self, fact: &Fact) -> Result<bool, MatchError> {
        if !self.test_header(fact) {
            return Ok(false);
        }
        match &self.script {
            Some(script) => script.evaluate(&fact.header_json(), &fact.payload),
            None => Ok(true),
        }
    }
}

/// A set of specs, ORed.
pub struct FactSpecsMatcher {
    matchers: Vec<FactSpecMatcher>,
}

impl FactSpecsMatcher {
    pub fn new(
        specs: &[FactSpec],
        engine: &ScriptEngine,
        versions: VersionMatch,
    ) -> Result<Self, MatchError> {
        let matchers = specs
            .iter()
            .cloned()
            .map(|spec| FactSpecMatcher::new(spec, engine, versions))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { matchers })
    }

    /// Whether any spec matches. The first script error is returned as-is.
    pub fn test(&self, fact: &Fact) -> Result<bool, MatchError> {
        for matcher in &self.matchers {
            if matcher.test(fact)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether any spec needs the payload to decide.
    pub fn needs_payload(&self) -> bool {
        self.matchers.iter().any(|m| m.spec.needs_payload())
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }
}

/// Whether `fact` satisfies `spec`, with exact version semantics.
pub fn matches(fact: &Fact, spec: &FactSpec) -> Result<bool, MatchError> {
    FactSpecMatcher::new(spec.clone(), &ScriptEngine::global(), VersionMatch::Exact)?.test(fact)
}

/// Whether `fact` satisfies any of `specs`, with exact version semantics.
pub fn matches_any(fact: &Fact, specs: &[FactSpec]) -> Result<bool, MatchError> {
    FactSpecsMatcher::new(specs, &ScriptEngine::global(), VersionMatch::Exact)?.test(fact)
}
