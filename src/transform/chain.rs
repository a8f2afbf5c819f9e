//! Transformation steps, chains and chain resolution.

use super::registry::SchemaRegistry;
use crate::error::TransformationError;
use crate::types::{Hash, TransformationKey};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// One registered step `key vFrom -> vTo`, content-addressed by its code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformationSource {
    pub key: TransformationKey,
    pub from: u32,
    pub to: u32,
    /// Step code. `None` marks a synthetic step that leaves the payload alone.
    pub code: Option<String>,
    pub hash: Hash,
}

impl TransformationSource {
    pub fn new(key: TransformationKey, from: u32, to: u32, code: Option<String>) -> Self {
        let addressed = format!(
            "{}/{}:{}->{}:{}",
            key.ns,
            key.fact_type,
            from,
            to,
            code.as_deref().unwrap_or("")
        );
        Self {
            hash: Hash::from_bytes(addressed.as_bytes()),
            key,
            from,
            to,
            code,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.code.is_none()
    }
}

/// Ordered steps taking `key` from one version to another.
///
/// The id is the hash of the ordered step hashes, so two chains with the same
/// steps are the same chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformationChain {
    pub key: TransformationKey,
    pub from: u32,
    pub to: u32,
    pub steps: Vec<TransformationSource>,
    pub id: Hash,
}

impl TransformationChain {
    /// The no-op chain for `version -> version`.
    pub fn identity(key: TransformationKey, version: u32) -> Self {
        let id = Hash::from_bytes(format!("identity:{key}:{version}").as_bytes());
        Self {
            key,
            from: version,
            to: version,
            steps: Vec::new(),
            id,
        }
    }

    pub fn from_steps(
        key: TransformationKey,
        from: u32,
        to: u32,
        steps: Vec<TransformationSource>,
    ) -> Self {
        let id = Hash::combine(steps.iter().map(|s| &s.hash));
        Self {
            key,
            from,
            to,
            steps,
            id,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.steps.is_empty()
    }

    /// True when no step carries code; applying it only relabels the version.
    pub fn is_synthetic(&self) -> bool {
        self.steps.iter().all(TransformationSource::is_synthetic)
    }
}

/// Resolves chains over the registered steps of one (namespace, type).
///
/// Only registered edges are followed; no intermediate version is ever
/// invented. Resolved chains are memoized until [`Self::clear`].
pub struct TransformationChainResolver {
    registry: Arc<dyn SchemaRegistry>,
    memo: RwLock<HashMap<(TransformationKey, u32, u32), TransformationChain>>,
}

impl TransformationChainResolver {
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self {
            registry,
            memo: RwLock::new(HashMap::new()),
        }
    }

    pub fn resolve(
        &self,
        key: &TransformationKey,
        from: u32,
        to: u32,
    ) -> Result<TransformationChain, TransformationError> {
        if from == to {
            return Ok(TransformationChain::identity(key.clone(), from));
        }

        let memo_key = (key.clone(), from, to);
        if let Some(chain) = self.memo.read().get(&memo_key) {
            return Ok(chain.clone());
        }

        let steps = match self.registry.resolve_transformation_step(key, from, to)? {
            Some(direct) => vec![direct],
            None => self.shortest_path(key, from, to)?,
        };

        let chain = TransformationChain::from_steps(key.clone(), from, to, steps);
        debug!(%key, from, to, chain = %chain.id, steps = chain.steps.len(), "resolved transformation chain");
        self.memo.write().insert(memo_key, chain.clone());
        Ok(chain)
    }

    /// Breadth-first search over registered edges.
    fn shortest_path(
        &self,
        key: &TransformationKey,
        from: u32,
        to: u32,
    ) -> Result<Vec<TransformationSource>, TransformationError> {
        let mut edges = self.registry.transformation_steps(key)?;
        edges.sort_by_key(|s| (s.from, s.to));

        let mut previous: HashMap<u32, TransformationSource> = HashMap::new();
        let mut visited = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);

        while let Some(version) = queue.pop_front() {
            if version == to {
                break;
            }
            for edge in edges.iter().filter(|e| e.from == version) {
                if visited.insert(edge.to) {
                    previous.insert(edge.to, edge.clone());
                    queue.push_back(edge.to);
                }
            }
        }

        let mut path = Vec::new();
        let mut current = to;
        while current != from {
            match previous.remove(&current) {
                Some(edge) => {
                    current = edge.from;
                    path.push(edge);
                }
                None => {
                    return Err(TransformationError::MissingTransformationInformation {
                        key: key.clone(),
                        from,
                        to,
                    })
                }
            }
        }
        path.reverse();
        Ok(path)
    }

    /// Forget memoized chains, e.g. after the registry changed.
    pub fn clear(&self) {
        self.memo.write().clear();
    }
}
