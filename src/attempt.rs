//! Optimistic publishing under advisory locks.
//!
//! A [`LockedOperation`] remembers the newest serial its caller has seen.
//! [`LockedOperation::attempt`] takes the write locks, checks that nothing
//! matching the declared specs was committed after that serial, runs the
//! caller's function and commits its facts before the locks are released.

use crate::blacklist::Blacklist;
use crate::error::{AbortReason, AttemptError};
use crate::lock::{AdvisoryWriteLock, LockScope};
use crate::matcher::{FactSpecsMatcher, ScriptEngine, VersionMatch};
use crate::storage::{FactStorage, RowShape};
use crate::types::{Fact, FactInput, FactSpec, Serial};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

const CONFLICT_SCAN_PAGE: usize = 1_000;

/// What the attempt function decided to publish.
pub struct IntermediatePublishResult {
    facts: Vec<FactInput>,
    and_then: Option<Box<dyn FnOnce() + Send>>,
}

impl IntermediatePublishResult {
    /// Publish `facts`. An empty list is a successful no-op.
    pub fn publish(facts: Vec<FactInput>) -> Self {
        Self {
            facts,
            and_then: None,
        }
    }

    /// Run `f` after the facts were committed and the locks released.
    pub fn and_then<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.and_then = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for IntermediatePublishResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntermediatePublishResult")
            .field("facts", &self.facts.len())
            .field("and_then", &self.and_then.is_some())
            .finish()
    }
}

/// Explicit abort from an attempt function.
#[derive(Debug)]
pub struct AttemptAborted {
    reason: AbortReason,
}

impl AttemptAborted {
    pub fn with_reason(message: impl Into<String>) -> Self {
        Self {
            reason: AbortReason::Message(message.into()),
        }
    }

    pub fn caused_by<E>(cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            reason: AbortReason::Cause(Box::new(cause)),
        }
    }
}

/// Facts committed by a successful attempt, in serial order.
#[derive(Clone, Debug, Default)]
pub struct PublishingResult {
    pub published: Vec<Fact>,
}

/// A pending optimistic write over a set of fact specs.
pub struct LockedOperation {
    storage: Arc<dyn FactStorage>,
    lock: AdvisoryWriteLock,
    scripts: Arc<ScriptEngine>,
    blacklist: Arc<Blacklist>,
    specs: Vec<FactSpec>,
    scope: LockScope,
    observed: Serial,
}

impl LockedOperation {
    pub(crate) fn new(
        storage: Arc<dyn FactStorage>,
        lock: AdvisoryWriteLock,
        scripts: Arc<ScriptEngine>,
        blacklist: Arc<Blacklist>,
        specs: Vec<FactSpec>,
        scope: LockScope,
        observed: Serial,
    ) -> Self {
        Self {
            storage,
            lock,
            scripts,
            blacklist,
            specs,
            scope,
            observed,
        }
    }

    /// Treat everything up to `serial` as already seen by the caller.
    pub fn optimistic_from(mut self, serial: Serial) -> Self {
        self.observed = serial;
        self
    }

    pub fn observed(&self) -> Serial {
        self.observed
    }

    pub fn scope(&self) -> &LockScope {
        &self.scope
    }

    /// Run `f` and publish its result, unless a conflicting fact was committed first.
    ///
    /// `f` runs at most once and only when no conflict was found. Returning
    /// `Ok(None)` from `f` aborts with [`AbortReason::NoResult`].
    pub fn attempt<F>(self, f: F) -> Result<PublishingResult, AttemptError>
    where
        F: FnOnce() -> Result<Option<IntermediatePublishResult>, AttemptAborted>,
    {
        let guard = self.lock.acquire(&self.scope)?;

        if let Some(conflict) = self.find_conflict()? {
            info!(
                fact_id = %conflict.id,
                serial = %conflict.serial,
                observed = %self.observed,
                "attempt aborted by concurrent modification"
            );
            return Err(AttemptError::Aborted(AbortReason::ConcurrentModification {
                fact_id: conflict.id,
                serial: conflict.serial,
            }));
        }

        let intermediate = match f() {
            Ok(Some(intermediate)) => intermediate,
            Ok(None) => return Err(AttemptError::Aborted(AbortReason::NoResult)),
            Err(aborted) => return Err(AttemptError::Aborted(aborted.reason)),
        };

        let published = if intermediate.facts.is_empty() {
            Vec::new()
        } else {
            self.storage.append(intermediate.facts)?
        };
        drop(guard);

        debug!(published = published.len(), "attempt committed");
        if let Some(and_then) = intermediate.and_then {
            and_then();
        }
        Ok(PublishingResult { published })
    }

    /// First fact after the observed serial that matches one of the specs.
    fn find_conflict(&self) -> Result<Option<Fact>, AttemptError> {
        let matcher = FactSpecsMatcher::new(&self.specs, &self.scripts, VersionMatch::Transformable)?;
        let storage_filters = self.storage.filters_completely(&self.specs);
        let blacklist = self.blacklist.snapshot();
        let mut after = self.observed;

        loop {
            let page =
                self.storage
                    .range_scan(&self.specs, after, CONFLICT_SCAN_PAGE, RowShape::Full)?;
            for fact in page.facts {
                if blacklist.contains(&fact.id) {
                    continue;
                }
                if storage_filters || matcher.test(&fact)? {
                    return Ok(Some(fact));
                }
            }
            if page.exhausted {
                return Ok(None);
            }
            after = after.max(page.scanned_to);
        }
    }
}
