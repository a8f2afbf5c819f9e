//! Filter scripts: compiled once per distinct source, shared by everyone.

use super::expr::ExpressionCompiler;
use crate::error::MatchError;
use crate::types::Hash;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Default number of compiled scripts kept.
pub const DEFAULT_SCRIPT_CACHE_SIZE: usize = 256;

/// A compiled filter predicate.
pub trait ScriptPredicate: Send + Sync {
    /// Evaluate against a fact header and payload.
    fn evaluate(&self, header: &Value, payload: &Value) -> Result<bool, MatchError>;
}

/// Turns script source into a [`ScriptPredicate`].
pub trait ScriptCompiler: Send + Sync {
    fn compile(&self, source: &str, hash: &Hash) -> Result<Arc<dyn ScriptPredicate>, MatchError>;
}

/// Content-addressed cache of compiled predicates.
pub struct ScriptEngine {
    compiler: Arc<dyn ScriptCompiler>,
    cache: Mutex<LruCache<Hash, Arc<dyn ScriptPredicate>>>,
}

static GLOBAL: OnceLock<Arc<ScriptEngine>> = OnceLock::new();

impl ScriptEngine {
    pub fn new(compiler: Arc<dyn ScriptCompiler>, cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            compiler,
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Engine using the built-in expression language.
    pub fn with_expressions(cache_size: usize) -> Self {
        Self::new(Arc::new(ExpressionCompiler), cache_size)
    }

    /// Lazily created process-wide engine using the built-in expression language.
    pub fn global() -> Arc<ScriptEngine> {
        Arc::clone(GLOBAL.get_or_init(|| {
            Arc::new(ScriptEngine::with_expressions(DEFAULT_SCRIPT_CACHE_SIZE))
        }))
    }

    /// Compiled predicate for `source`, compiling on first use.
    ///
    /// Compilation failures are not cached.
    pub fn predicate(&self, source: &str) -> Result<Arc<dyn ScriptPredicate>, MatchError> {
        let hash = Hash::from_bytes(source.as_bytes());
        if let Some(found) = self.cache.lock().get(&hash) {
            return Ok(Arc::clone(found));
        }

        let compiled = catch_unwind(AssertUnwindSafe(|| self.compiler.compile(source, &hash)))
            .unwrap_or_else(|_| {
                Err(MatchError::Compile {
                    hash: hash.to_hex(),
                    message: "compiler panicked".into(),
                })
            })?;

        debug!(script = %hash, "compiled filter script");
        let predicate = Arc::new(Isolated {
            inner: compiled,
            hash,
        }) as Arc<dyn ScriptPredicate>;
        self.cache.lock().put(hash, Arc::clone(&predicate));
        Ok(predicate)
    }

    /// Number of compiled scripts currently cached.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Turns a panic inside one evaluation into an error for that evaluation only.
struct Isolated {
    inner: Arc<dyn ScriptPredicate>,
    hash: Hash,
}

impl ScriptPredicate for Isolated {
    fn evaluate(&self, header: &Value, payload: &Value) -> Result<bool, MatchError> {
        catch_unwind(AssertUnwindSafe(|| self.inner.evaluate(header, payload))).unwrap_or_else(
            |_| {
                Err(MatchError::Evaluation {
                    hash: self.hash.to_hex(),
                    message: "script panicked".into(),
                })
            },
        )
    }
}
