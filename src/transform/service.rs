//! Bringing facts into requested versions.

use super::cache::TransformationCache;
use super::chain::{TransformationChain, TransformationChainResolver, TransformationSource};
use crate::error::TransformationError;
use crate::types::{Fact, FactSpec, TransformationKey};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::trace;

/// Executes the code of a single transformation step.
pub trait Transformer: Send + Sync {
    fn apply(&self, step: &TransformationSource, payload: Value) -> Result<Value, String>;
}

/// A transformation function registered in a [`FnTransformer`].
pub type TransformFn = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Transformer resolving step code to registered Rust functions.
///
/// The code string of a step is the name the function was registered under.
pub struct FnTransformer {
    functions: RwLock<HashMap<String, TransformFn>>,
}

impl FnTransformer {
    pub fn new() -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<F>(&self, code: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.write().insert(code.into(), Arc::new(f));
    }
}

impl Default for FnTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer for FnTransformer {
    fn apply(&self, step: &TransformationSource, payload: Value) -> Result<Value, String> {
        let code = match &step.code {
            Some(code) => code,
            None => return Ok(payload),
        };
        let function = self
            .functions
            .read()
            .get(code)
            .cloned()
            .ok_or_else(|| format!("no function registered for {code:?}"))?;
        function(payload)
    }
}

/// Versions a request asks for, per (namespace, type).
#[derive(Clone, Debug, Default)]
pub struct RequestedVersions {
    versions: HashMap<TransformationKey, BTreeSet<u32>>,
}

impl RequestedVersions {
    pub fn from_specs(specs: &[FactSpec]) -> Self {
        let mut versions: HashMap<TransformationKey, BTreeSet<u32>> = HashMap::new();
        for spec in specs {
            if let Some(ref fact_type) = spec.fact_type {
                versions
                    .entry(TransformationKey::new(&spec.ns, fact_type))
                    .or_default()
                    .insert(spec.version);
            }
        }
        Self { versions }
    }

    /// Version `fact` must be delivered in, or `None` to deliver it as stored.
    ///
    /// As-stored wins when any spec accepts any version or the stored one.
    /// Otherwise the highest requested version is the target.
    pub fn target_for(&self, fact: &Fact) -> Option<u32> {
        let requested = self.versions.get(&fact.transformation_key())?;
        if requested.contains(&0) || requested.contains(&fact.version) {
            return None;
        }
        requested.iter().next_back().copied()
    }
}

/// Resolves, applies and caches transformation chains.
pub struct FactTransformerService {
    resolver: TransformationChainResolver,
    cache: Arc<dyn TransformationCache>,
    transformer: Arc<dyn Transformer>,
}

impl FactTransformerService {
    pub fn new(
        resolver: TransformationChainResolver,
        cache: Arc<dyn TransformationCache>,
        transformer: Arc<dyn Transformer>,
    ) -> Self {
        Self {
            resolver,
            cache,
            transformer,
        }
    }

    pub fn resolver(&self) -> &TransformationChainResolver {
        &self.resolver
    }

    pub fn cache(&self) -> &Arc<dyn TransformationCache> {
        &self.cache
    }

    /// `fact` in version `target`. Target 0 or the stored version return it unchanged.
    pub fn transform(&self, fact: Fact, target: u32) -> Result<Fact, TransformationError> {
        if target == 0 || target == fact.version {
            return Ok(fact);
        }

        let chain = self
            .resolver
            .resolve(&fact.transformation_key(), fact.version, target)?;

        if chain.is_synthetic() {
            let mut relabeled = fact;
            relabeled.version = target;
            return Ok(relabeled);
        }

        if let Some(cached) = self.cache.find(fact.id, target, &chain.id) {
            trace!(fact = %fact.id, target, "transformation cache hit");
            return Ok(cached);
        }

        let transformed = self.apply(&chain, fact)?;
        self.cache.put(&transformed, &chain.id);
        Ok(transformed)
    }

    /// `fact` in whatever version `requested` asks for.
    pub fn transform_requested(
        &self,
        fact: Fact,
        requested: &RequestedVersions,
    ) -> Result<Fact, TransformationError> {
        match requested.target_for(&fact) {
            Some(target) => self.transform(fact, target),
            None => Ok(fact),
        }
    }

    /// Run every step of `chain` in order.
    pub fn apply(&self, chain: &TransformationChain, fact: Fact) -> Result<Fact, TransformationError> {
        let mut fact = fact;
        let mut payload = std::mem::take(&mut fact.payload);
        for step in &chain.steps {
            payload = self
                .transformer
                .apply(step, payload)
                .map_err(|message| TransformationError::StepFailed {
                    key: step.key.clone(),
                    from: step.from,
                    to: step.to,
                    message,
                })?;
        }
        fact.payload = payload;
        fact.version = chain.to;
        Ok(fact)
    }
}
