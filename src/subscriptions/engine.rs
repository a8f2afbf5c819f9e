//! Subscription orchestration.
//!
//! Each subscription runs on its own worker thread:
//! catchup, fast-forward check, `on_catchup`, then either `on_complete` or
//! follow mode until closed. Follow mode reuses the catchup scan from the
//! subscription's own position on every wake-up, so a fact committed while
//! catchup was finishing is delivered exactly once.

use super::catchup::{CatchupProgress, CatchupSource};
use super::live::LiveNotifier;
use super::pipeline::{FactPipeline, PipelineContext};
use super::types::{
    StartPosition, SubscriptionId, SubscriptionObserver, SubscriptionRequest, SubscriptionState,
};
use crate::error::{FactCastError, Result, SubscriptionError};
use crate::tail::TailIndexManager;
use crate::types::{Fact, Serial};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Starts subscriptions and owns what they share.
pub struct SubscriptionEngine {
    ctx: Arc<PipelineContext>,
    notifier: Arc<LiveNotifier>,
    tail: Arc<TailIndexManager>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl SubscriptionEngine {
    pub fn new(
        ctx: Arc<PipelineContext>,
        notifier: Arc<LiveNotifier>,
        tail: Arc<TailIndexManager>,
    ) -> Self {
        Self {
            ctx,
            notifier,
            tail,
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Refuse new subscriptions and end live delivery for the running ones.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            self.notifier.close();
            info!("subscription engine shut down");
        }
    }

    pub fn notifier(&self) -> &Arc<LiveNotifier> {
        &self.notifier
    }

    /// Start a subscription.
    ///
    /// The request is validated and its start position resolved before this
    /// returns. Everything after that, including filter compilation errors,
    /// reaches the observer.
    pub fn subscribe(
        &self,
        request: SubscriptionRequest,
        observer: Arc<dyn SubscriptionObserver>,
    ) -> Result<Subscription> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(FactCastError::ShutDown);
        }
        if request.specs.is_empty() {
            return Err(FactCastError::InvalidRequest(
                "at least one fact spec is required".to_string(),
            ));
        }
        if let Some(spec) = request.specs.iter().find(|s| s.ns.is_empty()) {
            return Err(FactCastError::InvalidRequest(format!(
                "fact spec without namespace: {spec:?}"
            )));
        }

        let start = if request.ephemeral {
            self.ctx.storage.current_max_serial()?
        } else {
            match request.start {
                StartPosition::FromScratch => Serial::ZERO,
                StartPosition::AfterSerial(serial) => serial,
                StartPosition::AfterId(id) => self
                    .ctx
                    .storage
                    .serial_of(id)?
                    .ok_or(FactCastError::UnknownStartId(id))?,
            }
        };

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let shared = Arc::new(Shared::new(id));
        info!(
            subscription = %id,
            %start,
            continuous = request.continuous,
            debug_info = %request.debug_info,
            "subscription started"
        );

        let worker = Worker {
            ctx: Arc::clone(&self.ctx),
            notifier: Arc::clone(&self.notifier),
            tail: Arc::clone(&self.tail),
            shared: Arc::clone(&shared),
            request,
            observer,
            start,
        };
        thread::Builder::new()
            .name(format!("factcast-{id}"))
            .spawn(move || worker.run())
            .map_err(|e| FactCastError::Storage(format!("failed to spawn subscription worker: {e}")))?;

        Ok(Subscription {
            shared,
            notifier: Arc::clone(&self.notifier),
        })
    }
}

struct Status {
    state: SubscriptionState,
    caught_up: bool,
}

/// State shared between a worker and its handle.
struct Shared {
    id: SubscriptionId,
    status: Mutex<Status>,
    changed: Condvar,
    cancelled: AtomicBool,
}

impl Shared {
    fn new(id: SubscriptionId) -> Self {
        Self {
            id,
            status: Mutex::new(Status {
                state: SubscriptionState::Starting,
                caught_up: false,
            }),
            changed: Condvar::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Move to `state` unless already terminal.
    fn transition(&self, state: SubscriptionState) {
        let mut status = self.status.lock();
        if !status.state.is_terminal() {
            status.state = state;
            self.changed.notify_all();
        }
    }

    /// Record the end of catchup together with the state that follows it.
    fn caught_up(&self, next: SubscriptionState) {
        let mut status = self.status.lock();
        status.caught_up = true;
        if !status.state.is_terminal() {
            status.state = next;
        }
        self.changed.notify_all();
    }

    /// Wait until `done` holds or the timeout elapses; returns the last value of `done`.
    fn wait_for(&self, timeout: Duration, done: impl Fn(&Status) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock();
        while !done(&status) && !status.state.is_terminal() {
            if self.changed.wait_until(&mut status, deadline).timed_out() {
                break;
            }
        }
        done(&status)
    }
}

struct Worker {
    ctx: Arc<PipelineContext>,
    notifier: Arc<LiveNotifier>,
    tail: Arc<TailIndexManager>,
    shared: Arc<Shared>,
    request: SubscriptionRequest,
    observer: Arc<dyn SubscriptionObserver>,
    start: Serial,
}

impl Worker {
    fn run(self) {
        let id = self.shared.id;
        let result = self.drive();
        self.notifier.unregister(id);

        match result {
            Ok(()) => debug!(subscription = %id, "subscription worker finished"),
            Err(_) if self.shared.is_cancelled() => {
                debug!(subscription = %id, "subscription closed while failing")
            }
            Err(e) => {
                warn!(subscription = %id, error = %e, "subscription failed");
                self.observer.on_error(e);
                self.shared.transition(SubscriptionState::Failed);
            }
        }
    }

    fn drive(&self) -> std::result::Result<(), SubscriptionError> {
        let id = self.shared.id;
        let pipeline = FactPipeline::new(Arc::clone(&self.ctx), self.request.clone())?;
        let source = CatchupSource::new(&pipeline, &self.shared.cancelled);
        let observer = &self.observer;
        let shared = &self.shared;
        let mut deliver = |fact: Fact| {
            if !shared.is_cancelled() {
                observer.on_next(fact);
            }
        };

        let mut position = self.start;
        if !self.request.ephemeral {
            self.shared.transition(SubscriptionState::Catchup);
            let progress = source.run(position, &mut deliver)?;
            debug!(
                subscription = %id,
                delivered = progress.delivered,
                position = %progress.position,
                "catchup finished"
            );
            if let Some(target) = self.fast_forward_target(progress) {
                self.observer.on_fast_forward(target);
            }
            position = progress.position;
        }
        if self.shared.is_cancelled() {
            return Ok(());
        }

        self.observer.on_catchup();
        if !self.request.continuous {
            self.observer.on_complete();
            self.shared.caught_up(SubscriptionState::Complete);
            return Ok(());
        }

        self.shared.caught_up(SubscriptionState::Follow);
        let wake = self.notifier.register(id);
        if self.shared.is_cancelled() {
            return Ok(());
        }

        // Disconnects when the handle unregisters.
        while wake.recv().is_ok() {
            if self.shared.is_cancelled() {
                break;
            }
            position = source.run(position, &mut deliver)?.position;
        }
        // Also reached when the notifier closes on shutdown.
        self.shared.transition(SubscriptionState::Closed);
        Ok(())
    }

    fn fast_forward_target(&self, progress: CatchupProgress) -> Option<Serial> {
        if progress.delivered > 0 || progress.position <= self.start {
            return None;
        }
        let mark = self.tail.high_water_mark()?;
        (self.start < mark.serial).then_some(progress.position)
    }
}

/// Handle to a running subscription. Dropping it closes the subscription.
pub struct Subscription {
    shared: Arc<Shared>,
    notifier: Arc<LiveNotifier>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.status.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_cancelled() || self.state().is_terminal()
    }

    /// Stop delivery.
    ///
    /// Catchup stops at the next page boundary and the live registration is
    /// removed immediately. Safe to call from inside an observer callback.
    pub fn close(&self) {
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notifier.unregister(self.shared.id);
        self.shared.transition(SubscriptionState::Closed);
        debug!(subscription = %self.shared.id, "subscription closed");
    }

    /// Wait up to `timeout` for catchup to finish. A timeout leaves the subscription running.
    pub fn await_catchup(&self, timeout: Duration) -> bool {
        self.shared.wait_for(timeout, |s| s.caught_up)
    }

    /// Wait up to `timeout` for a bounded subscription to complete.
    pub fn await_complete(&self, timeout: Duration) -> bool {
        self.shared
            .wait_for(timeout, |s| s.state == SubscriptionState::Complete)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}
