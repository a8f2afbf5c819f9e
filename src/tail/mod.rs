//! Tail index maintenance.
//!
//! Recent-range catchup scans are the hot path of an event store. A small
//! number of rolling "tail" indexes keep them fast; this module creates and
//! retires them under a cluster-wide lease and derives the high-water mark
//! subscriptions may fast-forward to.

mod lease;
mod manager;

pub use lease::{Lease, MemoryLease};
pub use manager::{
    TailCycleOutcome, TailCycleReport, TailIndexConfig, TailIndexJob, TailIndexManager,
    TAIL_INDEX_LEASE,
};
