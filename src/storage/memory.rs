//! In-memory fact storage.

use super::{FactStorage, LockMode, RowShape, ScanPage, TailIndex};
use crate::error::{FactCastError, Result};
use crate::notify::{ChangeBus, Signal};
use crate::types::{Fact, FactInput, FactSpec, Serial, Timestamp};
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Holders of one advisory lock code.
#[derive(Default)]
struct LockState {
    shared: usize,
    exclusive: bool,
}

impl LockState {
    fn can_grant(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !self.exclusive,
            LockMode::Exclusive => !self.exclusive && self.shared == 0,
        }
    }

    fn is_free(&self) -> bool {
        !self.exclusive && self.shared == 0
    }
}

/// Append-only log held in memory.
///
/// Serials are dense: the fact with serial `n` lives at index `n - 1`.
pub struct MemoryStorage {
    /// The log.
    facts: RwLock<Vec<Fact>>,

    /// Fact id to serial.
    ids: RwLock<HashMap<Uuid, Serial>>,

    /// Tail indexes by name.
    tail_indexes: RwLock<BTreeMap<String, TailIndex>>,

    /// Blacklisted fact ids.
    blacklist: RwLock<HashSet<Uuid>>,

    /// Advisory lock table.
    locks: Mutex<HashMap<i64, LockState>>,

    /// Signalled whenever a lock is released.
    lock_released: Condvar,

    bus: Arc<ChangeBus>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_bus(Arc::new(ChangeBus::new()))
    }

    /// Storage publishing on a bus shared with other collaborators.
    pub fn with_bus(bus: Arc<ChangeBus>) -> Self {
        Self {
            facts: RwLock::new(Vec::new()),
            ids: RwLock::new(HashMap::new()),
            tail_indexes: RwLock::new(BTreeMap::new()),
            blacklist: RwLock::new(HashSet::new()),
            locks: Mutex::new(HashMap::new()),
            lock_released: Condvar::new(),
            bus,
        }
    }

    /// Add a fact id to the blacklist table and announce the change.
    pub fn blacklist(&self, id: Uuid) {
        self.blacklist.write().insert(id);
        self.bus.publish(Signal::Blacklist);
    }

    /// Remove a fact id from the blacklist table and announce the change.
    pub fn unblacklist(&self, id: Uuid) {
        self.blacklist.write().remove(&id);
        self.bus.publish(Signal::Blacklist);
    }

    /// Number of stored facts.
    pub fn len(&self) -> usize {
        self.facts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.read().is_empty()
    }

    fn validate(input: &FactInput) -> Result<()> {
        if input.ns.is_empty() {
            return Err(FactCastError::InvalidFact(format!(
                "fact {} has an empty namespace",
                input.id
            )));
        }
        if input.fact_type.is_empty() {
            return Err(FactCastError::InvalidFact(format!(
                "fact {} has an empty type",
                input.id
            )));
        }
        if input.version == 0 {
            return Err(FactCastError::InvalidFact(format!(
                "fact {} has version 0",
                input.id
            )));
        }
        Ok(())
    }

    /// Coarse storage predicate: namespace and type only.
    fn candidate(fact: &Fact, specs: &[FactSpec]) -> bool {
        specs.iter().any(|spec| {
            spec.ns == fact.ns
                && spec
                    .fact_type
                    .as_ref()
                    .map_or(true, |t| *t == fact.fact_type)
        })
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl FactStorage for MemoryStorage {
    fn append(&self, inputs: Vec<FactInput>) -> Result<Vec<Fact>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let appended = {
            let mut facts = self.facts.write();
            let mut ids = self.ids.write();

            let mut batch_ids = HashSet::new();
            for input in &inputs {
                Self::validate(input)?;
                if ids.contains_key(&input.id) || !batch_ids.insert(input.id) {
                    return Err(FactCastError::DuplicateFactId(input.id));
                }
            }

            let mut appended = Vec::with_capacity(inputs.len());
            for input in inputs {
                let serial = Serial(facts.len() as u64 + 1);
                let fact = input.into_fact(serial);
                ids.insert(fact.id, serial);
                facts.push(fact.clone());
                appended.push(fact);
            }
            appended
        };

        let max_serial = appended.last().map(|f| f.serial).unwrap_or_default();
        debug!(count = appended.len(), %max_serial, "committed facts");
        self.bus.publish(Signal::NewFacts { max_serial });

        Ok(appended)
    }

    fn range_scan(
        &self,
        specs: &[FactSpec],
        after: Serial,
        page_size: usize,
        shape: RowShape,
    ) -> Result<ScanPage> {
        let page_size = page_size.max(1);
        let facts = self.facts.read();
        let start = (after.0 as usize).min(facts.len());

        let mut page = ScanPage {
            facts: Vec::new(),
            scanned_to: Serial(facts.len() as u64).max(after),
            exhausted: true,
        };

        for fact in &facts[start..] {
            if !Self::candidate(fact, specs) {
                continue;
            }
            if page.facts.len() == page_size {
                page.exhausted = false;
                break;
            }
            let mut row = fact.clone();
            if shape == RowShape::HeaderOnly {
                row.payload = Value::Null;
            }
            page.facts.push(row);
        }

        if !page.exhausted {
            if let Some(last) = page.facts.last() {
                page.scanned_to = last.serial;
            }
        }

        Ok(page)
    }

    fn filters_completely(&self, specs: &[FactSpec]) -> bool {
        specs.iter().all(|spec| {
            spec.aggregate_ids.is_empty()
                && spec.meta.is_empty()
                && spec.meta_key_exists.is_empty()
                && spec.filter_script.is_none()
                && (spec.version == 0 || spec.fact_type.is_some())
        })
    }

    fn current_max_serial(&self) -> Result<Serial> {
        Ok(Serial(self.facts.read().len() as u64))
    }

    fn fact_by_id(&self, id: Uuid) -> Result<Option<Fact>> {
        match self.serial_of(id)? {
            Some(serial) => self.fact_at(serial),
            None => Ok(None),
        }
    }

    fn fact_at(&self, serial: Serial) -> Result<Option<Fact>> {
        if serial.0 == 0 {
            return Ok(None);
        }
        Ok(self.facts.read().get(serial.0 as usize - 1).cloned())
    }

    fn serial_of(&self, id: Uuid) -> Result<Option<Serial>> {
        Ok(self.ids.read().get(&id).copied())
    }

    fn namespaces(&self) -> Result<BTreeSet<String>> {
        Ok(self.facts.read().iter().map(|f| f.ns.clone()).collect())
    }

    fn fact_types(&self, ns: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .facts
            .read()
            .iter()
            .filter(|f| f.ns == ns)
            .map(|f| f.fact_type.clone())
            .collect())
    }

    fn list_tail_indexes(&self) -> Result<Vec<TailIndex>> {
        Ok(self.tail_indexes.read().values().cloned().collect())
    }

    fn create_tail_index(&self, anchor: Serial, created: Timestamp) -> Result<TailIndex> {
        let name = TailIndex::name_for(created);
        let mut indexes = self.tail_indexes.write();
        let index = indexes
            .entry(name.clone())
            .or_insert_with(|| TailIndex {
                name,
                created,
                anchor,
            })
            .clone();
        Ok(index)
    }

    fn drop_tail_index(&self, name: &str) -> Result<()> {
        if self.tail_indexes.write().remove(name).is_none() {
            debug!(name, "tail index already gone");
        }
        Ok(())
    }

    fn acquire_lock(&self, code: i64, mode: LockMode, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut locks = self.locks.lock();

        loop {
            let state = locks.entry(code).or_default();
            if state.can_grant(mode) {
                match mode {
                    LockMode::Shared => state.shared += 1,
                    LockMode::Exclusive => state.exclusive = true,
                }
                return Ok(());
            }

            if self.lock_released.wait_until(&mut locks, deadline).timed_out() {
                let state = locks.entry(code).or_default();
                if state.can_grant(mode) {
                    continue;
                }
                return Err(FactCastError::LockTimeout {
                    code,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
    }

    fn release_lock(&self, code: i64, mode: LockMode) {
        let mut locks = self.locks.lock();
        match locks.get_mut(&code) {
            Some(state) => {
                match mode {
                    LockMode::Shared => state.shared = state.shared.saturating_sub(1),
                    LockMode::Exclusive => state.exclusive = false,
                }
                if state.is_free() {
                    locks.remove(&code);
                }
            }
            None => warn!(code, ?mode, "released a lock that was not held"),
        }
        self.lock_released.notify_all();
    }

    fn blacklisted_ids(&self) -> Result<HashSet<Uuid>> {
        Ok(self.blacklist.read().clone())
    }

    fn change_bus(&self) -> &ChangeBus {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    fn input(ns: &str, ty: &str) -> FactInput {
        FactInput::new(ns, ty, json!({"v": 1}))
    }

    #[test]
    fn test_append_assigns_consecutive_serials() {
        let storage = MemoryStorage::new();
        let first = storage.append(vec![input("a", "T"), input("a", "T")]).unwrap();
        let second = storage.append(vec![input("b", "T")]).unwrap();

        assert_eq!(first[0].serial, Serial(1));
        assert_eq!(first[1].serial, Serial(2));
        assert_eq!(second[0].serial, Serial(3));
        assert_eq!(storage.current_max_serial().unwrap(), Serial(3));
    }

    #[test]
    fn test_append_rejects_duplicates_atomically() {
        let storage = MemoryStorage::new();
        let id = Uuid::new_v4();
        storage.append(vec![input("a", "T").with_id(id)]).unwrap();

        let result = storage.append(vec![input("a", "T"), input("a", "T").with_id(id)]);
        assert!(matches!(result, Err(FactCastError::DuplicateFactId(dup)) if dup == id));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_append_rejects_version_zero() {
        let storage = MemoryStorage::new();
        let result = storage.append(vec![input("a", "T").with_version(0)]);
        assert!(matches!(result, Err(FactCastError::InvalidFact(_))));
    }

    #[test]
    fn test_append_publishes_new_facts() {
        let storage = MemoryStorage::new();
        let rx = storage.change_bus().subscribe();
        storage.append(vec![input("a", "T")]).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)).unwrap(),
            Signal::NewFacts { max_serial: Serial(1) }
        );
    }

    #[test]
    fn test_range_scan_pages() {
        let storage = MemoryStorage::new();
        for i in 0..10 {
            let ns = if i % 2 == 0 { "even" } else { "odd" };
            storage.append(vec![input(ns, "T")]).unwrap();
        }
        let specs = vec![FactSpec::ns("even")];

        let page = storage.range_scan(&specs, Serial::ZERO, 3, RowShape::Full).unwrap();
        let serials: Vec<u64> = page.facts.iter().map(|f| f.serial.0).collect();
        assert_eq!(serials, vec![1, 3, 5]);
        assert!(!page.exhausted);
        assert_eq!(page.scanned_to, Serial(5));

        let page = storage.range_scan(&specs, Serial(5), 3, RowShape::Full).unwrap();
        let serials: Vec<u64> = page.facts.iter().map(|f| f.serial.0).collect();
        assert_eq!(serials, vec![7, 9]);
        assert!(page.exhausted);
        assert_eq!(page.scanned_to, Serial(10));
    }

    #[test]
    fn test_header_only_rows_drop_payload() {
        let storage = MemoryStorage::new();
        storage.append(vec![input("a", "T")]).unwrap();
        let page = storage
            .range_scan(&[FactSpec::ns("a")], Serial::ZERO, 10, RowShape::HeaderOnly)
            .unwrap();
        assert_eq!(page.facts[0].payload, Value::Null);
    }

    #[test]
    fn test_filters_completely_leaves_untyped_versions_to_matcher() {
        let storage = MemoryStorage::new();
        assert!(storage.filters_completely(&[FactSpec::ns("a")]));
        assert!(storage.filters_completely(&[FactSpec::ns("a").fact_type("T").version(2)]));
        assert!(!storage.filters_completely(&[FactSpec::ns("a").version(2)]));
    }

    #[test]
    fn test_tail_index_create_is_idempotent() {
        let storage = MemoryStorage::new();
        let created = Timestamp(1_000);
        storage.create_tail_index(Serial(5), created).unwrap();
        storage.create_tail_index(Serial(9), created).unwrap();

        let indexes = storage.list_tail_indexes().unwrap();
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].anchor, Serial(5));

        storage.drop_tail_index(&indexes[0].name).unwrap();
        storage.drop_tail_index(&indexes[0].name).unwrap();
        assert!(storage.list_tail_indexes().unwrap().is_empty());
    }

    #[test]
    fn test_shared_locks_coexist_exclusive_waits() {
        let storage = MemoryStorage::new();
        let timeout = Duration::from_millis(20);
        storage.acquire_lock(1, LockMode::Shared, timeout).unwrap();
        storage.acquire_lock(1, LockMode::Shared, timeout).unwrap();

        let result = storage.acquire_lock(1, LockMode::Exclusive, timeout);
        assert!(matches!(result, Err(FactCastError::LockTimeout { code: 1, .. })));

        storage.release_lock(1, LockMode::Shared);
        storage.release_lock(1, LockMode::Shared);
        storage.acquire_lock(1, LockMode::Exclusive, timeout).unwrap();
    }

    #[test]
    fn test_exclusive_lock_handoff_between_threads() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .acquire_lock(7, LockMode::Exclusive, Duration::from_millis(10))
            .unwrap();

        let waiter = {
            let storage = Arc::clone(&storage);
            thread::spawn(move || storage.acquire_lock(7, LockMode::Exclusive, Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(50));
        storage.release_lock(7, LockMode::Exclusive);
        assert!(waiter.join().unwrap().is_ok());
    }
}
