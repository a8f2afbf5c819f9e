//! # FactCast
//!
//! An event store core: an append-only log of facts with ordered catchup,
//! live follow, version transformation and optimistic locked publishing.
//!
//! ## Core Concepts
//!
//! - **Facts**: immutable events with namespace, type, version, aggregate ids,
//!   metadata and a JSON payload, ordered by a store-assigned serial
//! - **FactSpecs**: filter clauses; a subscription delivers facts matching any of them
//! - **Subscriptions**: catchup from a start position, then optionally follow
//! - **Transformations**: registered steps bringing a payload from one version to another
//! - **Locked attempts**: publish only if nothing relevant was written since the caller looked
//!
//! ## Example
//!
//! ```ignore
//! use factcast::{ChannelObserver, FactInput, FactSpec, FactStore, StoreConfig, SubscriptionRequest};
//!
//! let store = FactStore::in_memory(StoreConfig::default())?;
//!
//! store.publish(vec![FactInput::new("users", "UserCreated", json!({"name": "Ada"}))])?;
//!
//! let (observer, events) = ChannelObserver::new();
//! let sub = store.subscribe(
//!     SubscriptionRequest::follow(vec![FactSpec::ns("users").fact_type("UserCreated")]),
//!     Arc::new(observer),
//! )?;
//! sub.await_catchup(Duration::from_secs(5));
//!
//! // Publish only if no user fact appeared in the meantime
//! store.lock(vec![FactSpec::ns("users")])?.attempt(|| {
//!     Ok(Some(IntermediatePublishResult::publish(vec![
//!         FactInput::new("users", "UserRenamed", json!({"name": "Ada L."})),
//!     ])))
//! })?;
//! ```

pub mod attempt;
pub mod blacklist;
pub mod error;
pub mod lock;
pub mod matcher;
pub mod notify;
pub mod storage;
pub mod store;
pub mod subscriptions;
pub mod tail;
pub mod transform;
pub mod types;

// Re-exports
pub use attempt::{AttemptAborted, IntermediatePublishResult, LockedOperation, PublishingResult};
pub use blacklist::Blacklist;
pub use error::{
    AbortReason, AttemptError, FactCastError, MatchError, Result, SubscriptionError,
    TransformationError,
};
pub use lock::{AdvisoryWriteLock, LockScope, WriteLockGuard, GLOBAL_LOCK_CODE};
pub use matcher::{matches, matches_any, FactSpecMatcher, FactSpecsMatcher, ScriptEngine, VersionMatch};
pub use notify::{ChangeBus, Signal};
pub use storage::{FactStorage, LockMode, MemoryStorage, RowShape, ScanPage, TailIndex};
pub use store::{FactStore, FactStoreBuilder, StoreConfig};
pub use subscriptions::{
    ChannelObserver, StartPosition, Subscription, SubscriptionEvent, SubscriptionId,
    SubscriptionObserver, SubscriptionRequest, SubscriptionState,
};
pub use tail::{Lease, MemoryLease, TailCycleOutcome, TailIndexConfig, TailIndexManager};
pub use transform::{
    FactTransformerService, FnTransformer, MemoryRegistry, MemoryTransformationCache,
    SchemaRegistry, TransformationCache, TransformationChain, Transformer,
};
pub use types::*;
