//! Main FactStore struct tying all components together.

use crate::attempt::LockedOperation;
use crate::blacklist::Blacklist;
use crate::error::{FactCastError, Result};
use crate::lock::{AdvisoryWriteLock, LockScope};
use crate::matcher::{ExpressionCompiler, ScriptCompiler, ScriptEngine, DEFAULT_SCRIPT_CACHE_SIZE};
use crate::notify::ChangeBus;
use crate::storage::{FactStorage, MemoryStorage};
use crate::subscriptions::{
    ListenerHandle, LiveNotifier, PipelineContext, Subscription, SubscriptionEngine,
    SubscriptionObserver, SubscriptionRequest,
};
use crate::tail::{Lease, MemoryLease, TailCycleOutcome, TailIndexConfig, TailIndexJob, TailIndexManager};
use crate::transform::{
    FactTransformerService, FnTransformer, MemoryRegistry, MemoryTransformationCache,
    SchemaRegistry, TransformationCache, TransformationChainResolver, Transformer,
    DEFAULT_TRANSFORMATION_CACHE_SIZE,
};
use crate::types::{Fact, FactInput, FactSpec, HighWaterMark, Serial, TransformationKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Rows fetched per catchup page.
    pub page_size: usize,

    /// How long a writer waits for its advisory locks.
    pub lock_timeout_ms: u64,

    /// Transformed facts kept in the transformation cache.
    pub transformation_cache_capacity: usize,

    /// Compiled filter scripts kept in memory.
    pub script_cache_capacity: usize,

    pub tail_index: TailIndexConfig,

    /// Load the blacklist and exclude its ids from delivery.
    pub blacklist_enabled: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: 1_000,
            lock_timeout_ms: 10_000,
            transformation_cache_capacity: DEFAULT_TRANSFORMATION_CACHE_SIZE,
            script_cache_capacity: DEFAULT_SCRIPT_CACHE_SIZE,
            tail_index: TailIndexConfig::default(),
            blacklist_enabled: true,
        }
    }
}

impl StoreConfig {
    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: StoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(FactCastError::InvalidConfiguration(
                "page_size must be positive".to_string(),
            ));
        }
        if self.tail_index.generations == 0 {
            return Err(FactCastError::InvalidConfiguration(
                "tail_index.generations must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Assembles a [`FactStore`] from its collaborators.
///
/// Anything not supplied is in-memory. Components created by the builder
/// share the builder's [`ChangeBus`], so pass [`bus`](Self::bus) to custom
/// components that should announce changes.
pub struct FactStoreBuilder {
    config: StoreConfig,
    bus: Arc<ChangeBus>,
    storage: Option<Arc<dyn FactStorage>>,
    registry: Option<Arc<dyn SchemaRegistry>>,
    transformer: Option<Arc<dyn Transformer>>,
    cache: Option<Arc<dyn TransformationCache>>,
    lease: Option<Arc<dyn Lease>>,
    scripts: Option<Arc<dyn ScriptCompiler>>,
}

impl FactStoreBuilder {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            bus: Arc::new(ChangeBus::new()),
            storage: None,
            registry: None,
            transformer: None,
            cache: None,
            lease: None,
            scripts: None,
        }
    }

    pub fn bus(&self) -> Arc<ChangeBus> {
        Arc::clone(&self.bus)
    }

    pub fn storage(mut self, storage: Arc<dyn FactStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn transformation_cache(mut self, cache: Arc<dyn TransformationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn lease(mut self, lease: Arc<dyn Lease>) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn script_compiler(mut self, compiler: Arc<dyn ScriptCompiler>) -> Self {
        self.scripts = Some(compiler);
        self
    }

    pub fn build(self) -> Result<FactStore> {
        self.config.validate()?;
        let config = self.config;
        let bus = self.bus;

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::with_bus(Arc::clone(&bus))));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(MemoryRegistry::with_bus(Arc::clone(&bus))));
        let transformer = self
            .transformer
            .unwrap_or_else(|| Arc::new(FnTransformer::new()));
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(MemoryTransformationCache::new(
                config.transformation_cache_capacity,
            ))
        });
        let lease = self.lease.unwrap_or_else(|| Arc::new(MemoryLease::new()));
        let compiler = self
            .scripts
            .unwrap_or_else(|| Arc::new(ExpressionCompiler));

        let blacklist = Arc::new(Blacklist::new(Arc::clone(&storage), config.blacklist_enabled));
        blacklist.load()?;

        let scripts = Arc::new(ScriptEngine::new(compiler, config.script_cache_capacity));
        let transformation = Arc::new(FactTransformerService::new(
            TransformationChainResolver::new(Arc::clone(&registry)),
            cache,
            transformer,
        ));
        let notifier = Arc::new(LiveNotifier::new(
            Arc::clone(&blacklist),
            Arc::clone(&transformation),
        ));

        let mut listeners = vec![LiveNotifier::listen(&notifier, storage.change_bus().subscribe())];
        if !std::ptr::eq(storage.change_bus(), Arc::as_ptr(&bus)) {
            listeners.push(LiveNotifier::listen(&notifier, bus.subscribe()));
        }

        let tail = Arc::new(TailIndexManager::new(
            Arc::clone(&storage),
            lease,
            config.tail_index.clone(),
        ));
        let ctx = Arc::new(PipelineContext {
            storage: Arc::clone(&storage),
            blacklist: Arc::clone(&blacklist),
            scripts: Arc::clone(&scripts),
            transformer: Arc::clone(&transformation),
            page_size: config.page_size,
        });
        let engine = SubscriptionEngine::new(ctx, notifier, Arc::clone(&tail));

        info!(
            page_size = config.page_size,
            blacklisted = blacklist.len(),
            "fact store ready"
        );

        Ok(FactStore {
            write_lock: AdvisoryWriteLock::new(Arc::clone(&storage), config.lock_timeout()),
            config,
            storage,
            registry,
            blacklist,
            scripts,
            transformation,
            engine,
            tail,
            listeners: Mutex::new(listeners),
            tail_job: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// The fact store.
///
/// Provides a unified interface for:
/// - Publishing facts, plainly or as locked optimistic attempts
/// - Subscribing with catchup and live follow
/// - Reading single facts, optionally transformed into another version
/// - Tail index maintenance and cache housekeeping
pub struct FactStore {
    config: StoreConfig,
    storage: Arc<dyn FactStorage>,
    registry: Arc<dyn SchemaRegistry>,
    blacklist: Arc<Blacklist>,
    scripts: Arc<ScriptEngine>,
    transformation: Arc<FactTransformerService>,
    engine: SubscriptionEngine,
    tail: Arc<TailIndexManager>,
    write_lock: AdvisoryWriteLock,
    listeners: Mutex<Vec<ListenerHandle>>,
    tail_job: Mutex<Option<TailIndexJob>>,
    shut_down: AtomicBool,
}

impl FactStore {
    /// A store with in-memory collaborators.
    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        FactStoreBuilder::new(config).build()
    }

    pub fn builder(config: StoreConfig) -> FactStoreBuilder {
        FactStoreBuilder::new(config)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn FactStorage> {
        &self.storage
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(FactCastError::ShutDown)
        } else {
            Ok(())
        }
    }

    // --- Publishing ---

    /// Publish facts atomically, holding the locks of every namespace written.
    pub fn publish(&self, facts: Vec<FactInput>) -> Result<Vec<Fact>> {
        self.ensure_open()?;
        if facts.is_empty() {
            return Ok(Vec::new());
        }

        let scope = LockScope::namespaces(facts.iter().map(|f| f.ns.as_str()));
        let _guard = self.write_lock.acquire(&scope)?;
        let published = self.storage.append(facts)?;
        debug!(count = published.len(), "published facts");
        Ok(published)
    }

    /// Prepare an optimistic write depending on `specs`, locking their namespaces.
    pub fn lock(&self, specs: Vec<FactSpec>) -> Result<LockedOperation> {
        let scope = LockScope::namespaces(specs.iter().map(|s| s.ns.as_str()));
        self.locked_operation(specs, scope)
    }

    /// Like [`lock`](Self::lock), but excluding every other writer.
    pub fn lock_global(&self, specs: Vec<FactSpec>) -> Result<LockedOperation> {
        self.locked_operation(specs, LockScope::Global)
    }

    fn locked_operation(&self, specs: Vec<FactSpec>, scope: LockScope) -> Result<LockedOperation> {
        self.ensure_open()?;
        if specs.is_empty() {
            return Err(FactCastError::InvalidRequest(
                "a locked operation needs at least one fact spec".to_string(),
            ));
        }
        let observed = self.storage.current_max_serial()?;
        Ok(LockedOperation::new(
            Arc::clone(&self.storage),
            AdvisoryWriteLock::new(Arc::clone(&self.storage), self.config.lock_timeout()),
            Arc::clone(&self.scripts),
            Arc::clone(&self.blacklist),
            specs,
            scope,
            observed,
        ))
    }

    // --- Subscriptions ---

    pub fn subscribe(
        &self,
        request: SubscriptionRequest,
        observer: Arc<dyn SubscriptionObserver>,
    ) -> Result<Subscription> {
        self.ensure_open()?;
        self.engine.subscribe(request, observer)
    }

    // --- Reads ---

    /// A fact as stored. Blacklisted facts are not returned.
    pub fn fetch_by_id(&self, id: Uuid) -> Result<Option<Fact>> {
        if self.blacklist.contains(&id) {
            return Ok(None);
        }
        self.storage.fact_by_id(id)
    }

    /// A fact transformed into `version`.
    ///
    /// Transformation failures surface as [`FactCastError::Transformation`].
    pub fn fetch_by_id_in_version(&self, id: Uuid, version: u32) -> Result<Option<Fact>> {
        match self.fetch_by_id(id)? {
            Some(fact) => Ok(Some(self.transformation.transform(fact, version)?)),
            None => Ok(None),
        }
    }

    pub fn serial_of(&self, id: Uuid) -> Result<Option<Serial>> {
        self.storage.serial_of(id)
    }

    pub fn current_max_serial(&self) -> Result<Serial> {
        self.storage.current_max_serial()
    }

    pub fn enumerate_namespaces(&self) -> Result<BTreeSet<String>> {
        self.storage.namespaces()
    }

    pub fn enumerate_types(&self, ns: &str) -> Result<BTreeSet<String>> {
        self.storage.fact_types(ns)
    }

    pub fn schema(&self, key: &TransformationKey, version: u32) -> Result<Option<Value>> {
        self.registry.resolve_schema(key, version)
    }

    // --- Maintenance ---

    /// Reload the blacklist now instead of waiting for a change signal.
    pub fn refresh_blacklist(&self) -> Result<usize> {
        self.blacklist.refresh()
    }

    pub fn run_tail_index_cycle(&self) -> Result<TailCycleOutcome> {
        self.tail.run_cycle()
    }

    pub fn high_water_mark(&self) -> Option<HighWaterMark> {
        self.tail.high_water_mark()
    }

    /// Run tail index cycles in the background until shutdown. Idempotent.
    pub fn start_tail_index_job(&self) -> Result<()> {
        self.ensure_open()?;
        let mut job = self.tail_job.lock();
        if job.is_none() {
            *job = Some(TailIndexManager::spawn(&self.tail));
        }
        Ok(())
    }

    /// Evict transformed facts not used for `older_than`. Returns how many were evicted.
    pub fn compact_transformation_cache(&self, older_than: Duration) -> usize {
        let evicted = self.transformation.cache().compact(older_than);
        debug!(evicted, "compacted transformation cache");
        evicted
    }

    /// Stop background work and end all subscriptions. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.engine.shutdown();
        if let Some(mut job) = self.tail_job.lock().take() {
            job.stop();
        }
        for mut listener in self.listeners.lock().drain(..) {
            listener.stop();
        }
        info!("fact store shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for FactStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
