//! Periodic creation and retirement of tail indexes.

use super::lease::Lease;
use crate::error::Result;
use crate::storage::{FactStorage, TailIndex};
use crate::types::{HighWaterMark, Timestamp};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Name of the lease guarding the tail-index job.
pub const TAIL_INDEX_LEASE: &str = "tail-index-maintenance";

/// Tail index settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TailIndexConfig {
    /// Whether the job runs at all.
    pub enabled: bool,

    /// Number of tail indexes kept. Older ones are dropped.
    pub generations: usize,

    /// A new index is only created once the youngest is at least this old.
    pub min_age_secs: u64,

    /// Time between scheduled runs.
    pub interval_secs: u64,

    /// Lease hold time; bounds how long a crashed runner blocks others.
    pub lease_ttl_secs: u64,
}

impl Default for TailIndexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            generations: 3,
            min_age_secs: 24 * 60 * 60,
            interval_secs: 60 * 60,
            lease_ttl_secs: 5 * 60,
        }
    }
}

impl TailIndexConfig {
    pub fn min_age(&self) -> Duration {
        Duration::from_secs(self.min_age_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

/// What one maintenance cycle did.
#[derive(Clone, Debug, Default)]
pub struct TailCycleReport {
    pub created: Option<TailIndex>,
    pub retired: Vec<String>,
    pub high_water_mark: Option<HighWaterMark>,
}

#[derive(Clone, Debug)]
pub enum TailCycleOutcome {
    /// Disabled, or another node holds the lease.
    Skipped,
    Completed(TailCycleReport),
}

/// Keeps a bounded set of tail indexes and publishes the high-water mark.
///
/// Each cycle goes idle -> maybe-create -> maybe-retire -> refresh-mark.
/// Indexes only make scans faster; their absence never changes results.
pub struct TailIndexManager {
    storage: Arc<dyn FactStorage>,
    lease: Arc<dyn Lease>,
    config: TailIndexConfig,
    holder: String,
    high_water_mark: RwLock<Option<HighWaterMark>>,
}

impl TailIndexManager {
    pub fn new(storage: Arc<dyn FactStorage>, lease: Arc<dyn Lease>, config: TailIndexConfig) -> Self {
        Self {
            storage,
            lease,
            config,
            holder: format!("tail-index-{}", Uuid::new_v4()),
            high_water_mark: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &TailIndexConfig {
        &self.config
    }

    /// Newest position covered by the youngest tail index, as of the last cycle.
    pub fn high_water_mark(&self) -> Option<HighWaterMark> {
        *self.high_water_mark.read()
    }

    pub fn run_cycle(&self) -> Result<TailCycleOutcome> {
        self.run_cycle_at(Timestamp::now())
    }

    /// Run one cycle as if the clock read `now`.
    pub fn run_cycle_at(&self, now: Timestamp) -> Result<TailCycleOutcome> {
        if !self.config.enabled {
            return Ok(TailCycleOutcome::Skipped);
        }
        if !self
            .lease
            .try_acquire(TAIL_INDEX_LEASE, &self.holder, self.config.lease_ttl())?
        {
            debug!("tail index lease held elsewhere, skipping cycle");
            return Ok(TailCycleOutcome::Skipped);
        }

        let result = self.cycle(now);
        self.lease.release(TAIL_INDEX_LEASE, &self.holder);
        result.map(TailCycleOutcome::Completed)
    }

    fn cycle(&self, now: Timestamp) -> Result<TailCycleReport> {
        let mut report = TailCycleReport::default();

        // Youngest first.
        let mut indexes = self.storage.list_tail_indexes()?;
        indexes.sort_by(|a, b| b.created.cmp(&a.created));

        let youngest_is_old = indexes
            .first()
            .map_or(true, |youngest| youngest.created.age_at(now) >= self.config.min_age());
        if youngest_is_old {
            let anchor = self.storage.current_max_serial()?;
            if anchor.0 > 0 {
                let created = self.storage.create_tail_index(anchor, now)?;
                info!(name = %created.name, %anchor, "created tail index");
                indexes.insert(0, created.clone());
                report.created = Some(created);
            }
        }

        if !self
            .lease
            .renew(TAIL_INDEX_LEASE, &self.holder, self.config.lease_ttl())?
        {
            warn!("lost tail index lease mid-cycle, leaving retirement to the next run");
            return Ok(report);
        }

        if indexes.len() > self.config.generations {
            for index in indexes.split_off(self.config.generations) {
                match self.storage.drop_tail_index(&index.name) {
                    Ok(()) => {
                        info!(name = %index.name, "retired tail index");
                        report.retired.push(index.name);
                    }
                    Err(e) => warn!(name = %index.name, error = %e, "failed to retire tail index"),
                }
            }
        }

        if let Some(youngest) = indexes.first() {
            if let Some(fact) = self.storage.fact_at(youngest.anchor)? {
                let mark = HighWaterMark {
                    fact_id: fact.id,
                    serial: fact.serial,
                };
                *self.high_water_mark.write() = Some(mark);
                report.high_water_mark = Some(mark);
            }
        }

        Ok(report)
    }

    /// Run cycles every `interval` on a background thread until the job is stopped.
    pub fn spawn(manager: &Arc<Self>) -> TailIndexJob {
        let (stop, stopped) = bounded::<()>(0);
        let interval = manager.config.interval();
        let manager = Arc::clone(manager);

        let handle = thread::spawn(move || loop {
            if let Err(e) = manager.run_cycle() {
                error!(error = %e, "tail index cycle failed, retrying next run");
            }
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        });

        TailIndexJob {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

/// Handle to the scheduled tail-index job. Dropping it stops the job.
pub struct TailIndexJob {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TailIndexJob {
    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("tail index job panicked");
            }
        }
    }
}

impl Drop for TailIndexJob {
    fn drop(&mut self) {
        self.stop();
    }
}
