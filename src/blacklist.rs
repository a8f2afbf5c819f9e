//! Fact ids excluded from every delivery path.
//!
//! Readers take an `Arc` snapshot of the current set; a refresh builds a new
//! set and swaps the pointer, so nobody ever observes a half-updated set.

use crate::error::Result;
use crate::storage::FactStorage;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Process-wide view of the blacklist table.
pub struct Blacklist {
    current: RwLock<Arc<HashSet<Uuid>>>,
    storage: Arc<dyn FactStorage>,
    enabled: bool,
}

impl Blacklist {
    /// Create an empty blacklist backed by `storage`. Call [`Self::load`] to populate.
    pub fn new(storage: Arc<dyn FactStorage>, enabled: bool) -> Self {
        Self {
            current: RwLock::new(Arc::new(HashSet::new())),
            storage,
            enabled,
        }
    }

    /// Populate from storage at startup.
    pub fn load(&self) -> Result<usize> {
        self.refresh()
    }

    /// Re-read the blacklist table and swap in the new set.
    ///
    /// On failure the previous set stays in place.
    pub fn refresh(&self) -> Result<usize> {
        if !self.enabled {
            return Ok(0);
        }
        let ids = self.storage.blacklisted_ids()?;
        let count = ids.len();
        *self.current.write() = Arc::new(ids);
        debug!(count, "blacklist refreshed");
        Ok(count)
    }

    /// Refresh, logging instead of failing. Used by the change listener.
    pub fn refresh_or_log(&self) {
        if let Err(e) = self.refresh() {
            warn!(error = %e, "blacklist refresh failed, keeping previous set");
        }
    }

    /// Consistent view of the current set.
    pub fn snapshot(&self) -> Arc<HashSet<Uuid>> {
        Arc::clone(&self.current.read())
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.current.read().contains(id)
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }

    /// Drop the in-memory set on shutdown.
    pub fn clear(&self) {
        *self.current.write() = Arc::new(HashSet::new());
        info!("blacklist cleared");
    }
}
