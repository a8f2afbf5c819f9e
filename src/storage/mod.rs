//! Storage collaborator interface.
//!
//! The subscription engine never touches a physical log directly. Everything
//! it needs from storage goes through [`FactStorage`]: ordered range scans,
//! the current head, tail-index bookkeeping, advisory locks, the blacklist
//! table and a change bus. [`MemoryStorage`] is a complete in-process
//! implementation.

mod memory;

pub use memory::MemoryStorage;

use crate::error::Result;
use crate::notify::ChangeBus;
use crate::types::{Fact, FactInput, FactSpec, Serial, Timestamp};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// Which columns a range scan returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowShape {
    /// Header and payload.
    Full,
    /// Header only; payloads come back as `Null`.
    HeaderOnly,
}

/// Advisory lock mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// One page of a range scan.
#[derive(Clone, Debug, Default)]
pub struct ScanPage {
    /// Candidate facts in strictly ascending serial order.
    pub facts: Vec<Fact>,
    /// Highest serial examined by this scan (matching or not).
    pub scanned_to: Serial,
    /// True when no candidate beyond this page existed at scan time.
    pub exhausted: bool,
}

/// Marker for a physical tail index covering serials above `anchor`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TailIndex {
    pub name: String,
    pub created: Timestamp,
    pub anchor: Serial,
}

impl TailIndex {
    /// Canonical name for an index created at `created`.
    pub fn name_for(created: Timestamp) -> String {
        format!("fact_tail_{}", created.0)
    }
}

/// The storage engine as seen by the subscription engine.
pub trait FactStorage: Send + Sync {
    /// Commit facts atomically, assigning consecutive serials.
    ///
    /// Implementations publish [`crate::notify::Signal::NewFacts`] after commit.
    fn append(&self, facts: Vec<FactInput>) -> Result<Vec<Fact>>;

    /// Facts after `after` that may match any of `specs`, at most `page_size` of them.
    ///
    /// The storage predicate may be coarser than the specs; see [`Self::filters_completely`].
    fn range_scan(
        &self,
        specs: &[FactSpec],
        after: Serial,
        page_size: usize,
        shape: RowShape,
    ) -> Result<ScanPage>;

    /// Whether `range_scan` already applies every constraint of `specs`
    /// except the requested version of typed specs.
    fn filters_completely(&self, specs: &[FactSpec]) -> bool;

    fn current_max_serial(&self) -> Result<Serial>;

    fn fact_by_id(&self, id: Uuid) -> Result<Option<Fact>>;

    fn fact_at(&self, serial: Serial) -> Result<Option<Fact>>;

    fn serial_of(&self, id: Uuid) -> Result<Option<Serial>>;

    fn namespaces(&self) -> Result<BTreeSet<String>>;

    fn fact_types(&self, ns: &str) -> Result<BTreeSet<String>>;

    fn list_tail_indexes(&self) -> Result<Vec<TailIndex>>;

    /// Create an index anchored at `anchor`. Creating an existing index is a no-op.
    fn create_tail_index(&self, anchor: Serial, created: Timestamp) -> Result<TailIndex>;

    /// Drop an index. Dropping a missing index is a no-op.
    fn drop_tail_index(&self, name: &str) -> Result<()>;

    /// Block until the lock is held or `timeout` elapses.
    fn acquire_lock(&self, code: i64, mode: LockMode, timeout: Duration) -> Result<()>;

    fn release_lock(&self, code: i64, mode: LockMode);

    fn blacklisted_ids(&self) -> Result<HashSet<Uuid>>;

    fn change_bus(&self) -> &ChangeBus;
}
