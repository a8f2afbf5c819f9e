//! Version transformation of facts.
//!
//! Registered steps form a directed graph per (namespace, type). A consumer
//! asking for a version other than the stored one gets the fact run through
//! the chain of registered steps, with results memoized in a
//! [`TransformationCache`].

mod cache;
mod chain;
mod registry;
mod service;

pub use cache::{
    CacheKey, MemoryTransformationCache, TransformationCache, DEFAULT_TRANSFORMATION_CACHE_SIZE,
};
pub use chain::{TransformationChain, TransformationChainResolver, TransformationSource};
pub use registry::{MemoryRegistry, SchemaRegistry};
pub use service::{FactTransformerService, FnTransformer, RequestedVersions, TransformFn, Transformer};
