//! Advisory write locks serializing conflicting writers.
//!
//! Lock order is fixed: the global cross-namespace lock first, then namespace
//! locks in ascending code order. Every writer follows it, so two writers can
//! never wait on each other in a cycle.

use crate::error::Result;
use crate::storage::{FactStorage, LockMode};
use crate::types::Hash;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Lock code of the global cross-namespace lock.
pub const GLOBAL_LOCK_CODE: i64 = 0x6661_6374_6361_7374;

/// Lock code for a namespace.
pub fn namespace_lock_code(ns: &str) -> i64 {
    let code = Hash::from_bytes(format!("ns:{ns}").as_bytes()).prefix_i64();
    // Never collide with the global code.
    if code == GLOBAL_LOCK_CODE {
        code.wrapping_add(1)
    } else {
        code
    }
}

/// What a writer wants to lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockScope {
    /// Exclusive over every namespace.
    Global,
    /// Exclusive over the listed namespaces, shared over the global lock.
    Namespaces(BTreeSet<String>),
}

impl LockScope {
    pub fn namespaces<'a>(namespaces: impl IntoIterator<Item = &'a str>) -> Self {
        LockScope::Namespaces(namespaces.into_iter().map(str::to_string).collect())
    }

    /// Lock codes in acquisition order.
    fn plan(&self) -> Vec<(i64, LockMode)> {
        match self {
            LockScope::Global => vec![(GLOBAL_LOCK_CODE, LockMode::Exclusive)],
            LockScope::Namespaces(namespaces) => {
                let codes: BTreeSet<i64> =
                    namespaces.iter().map(|ns| namespace_lock_code(ns)).collect();
                std::iter::once((GLOBAL_LOCK_CODE, LockMode::Shared))
                    .chain(codes.into_iter().map(|c| (c, LockMode::Exclusive)))
                    .collect()
            }
        }
    }
}

/// Acquires storage-level advisory locks in the canonical order.
pub struct AdvisoryWriteLock {
    storage: Arc<dyn FactStorage>,
    timeout: Duration,
}

impl AdvisoryWriteLock {
    pub fn new(storage: Arc<dyn FactStorage>, timeout: Duration) -> Self {
        Self { storage, timeout }
    }

    /// Block until every lock in `scope` is held.
    ///
    /// On timeout the locks taken so far are released and the error is returned.
    pub fn acquire(&self, scope: &LockScope) -> Result<WriteLockGuard> {
        let mut guard = WriteLockGuard {
            storage: Arc::clone(&self.storage),
            held: Vec::new(),
        };

        for (code, mode) in scope.plan() {
            self.storage.acquire_lock(code, mode, self.timeout)?;
            trace!(code, ?mode, "advisory lock acquired");
            guard.held.push((code, mode));
        }

        debug!(?scope, locks = guard.held.len(), "write lock held");
        Ok(guard)
    }
}

/// Held advisory locks; released in reverse order on drop.
pub struct WriteLockGuard {
    storage: Arc<dyn FactStorage>,
    held: Vec<(i64, LockMode)>,
}

impl WriteLockGuard {
    /// Codes currently held, in acquisition order.
    pub fn held(&self) -> &[(i64, LockMode)] {
        &self.held
    }
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        while let Some((code, mode)) = self.held.pop() {
            self.storage.release_lock(code, mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FactCastError;
    use crate::storage::MemoryStorage;

    fn lock(storage: &Arc<MemoryStorage>, timeout_ms: u64) -> AdvisoryWriteLock {
        AdvisoryWriteLock::new(storage.clone(), Duration::from_millis(timeout_ms))
    }

    #[test]
    fn test_global_lock_comes_first() {
        let scope = LockScope::namespaces(["b", "a"]);
        let plan = scope.plan();
        assert_eq!(plan[0], (GLOBAL_LOCK_CODE, LockMode::Shared));
        assert_eq!(plan.len(), 3);
        assert!(plan[1].0 < plan[2].0);
    }

    #[test]
    fn test_disjoint_namespaces_do_not_block() {
        let storage = Arc::new(MemoryStorage::new());
        let locks = lock(&storage, 20);

        let _a = locks.acquire(&LockScope::namespaces(["users"])).unwrap();
        let _b = locks.acquire(&LockScope::namespaces(["orders"])).unwrap();
    }

    #[test]
    fn test_overlapping_namespaces_block() {
        let storage = Arc::new(MemoryStorage::new());
        let locks = lock(&storage, 20);

        let _a = locks.acquire(&LockScope::namespaces(["users"])).unwrap();
        let result = locks.acquire(&LockScope::namespaces(["orders", "users"]));
        assert!(matches!(result, Err(FactCastError::LockTimeout { .. })));

        // The partially acquired "orders" lock was released again.
        let _c = locks.acquire(&LockScope::namespaces(["orders"])).unwrap();
    }

    #[test]
    fn test_global_excludes_namespace_writers() {
        let storage = Arc::new(MemoryStorage::new());
        let locks = lock(&storage, 20);

        let global = locks.acquire(&LockScope::Global).unwrap();
        assert!(locks.acquire(&LockScope::namespaces(["users"])).is_err());
        drop(global);
        assert!(locks.acquire(&LockScope::namespaces(["users"])).is_ok());
    }
}
