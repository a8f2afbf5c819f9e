//! Wake-ups for following subscriptions.
//!
//! Every following subscription registers a bounded(1) wake channel. A
//! commit signal fills each channel at most once, so any number of commits
//! between two drains collapses into one wake-up. The worker then rescans
//! from its own position, which is what keeps delivery gap-free.

use super::types::SubscriptionId;
use crate::blacklist::Blacklist;
use crate::notify::Signal;
use crate::transform::FactTransformerService;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

/// Fans change signals out to registered subscriptions.
pub struct LiveNotifier {
    registrations: RwLock<HashMap<SubscriptionId, Sender<()>>>,
    closed: AtomicBool,
    blacklist: Arc<Blacklist>,
    transformer: Arc<FactTransformerService>,
}

impl LiveNotifier {
    pub fn new(blacklist: Arc<Blacklist>, transformer: Arc<FactTransformerService>) -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            blacklist,
            transformer,
        }
    }

    /// Register a subscription. The returned receiver yields one `()` per batch of changes.
    ///
    /// The channel starts out signalled so that anything committed between
    /// the end of catchup and registration is picked up. After [`close`](Self::close)
    /// the receiver is already disconnected.
    pub fn register(&self, id: SubscriptionId) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        let _ = tx.try_send(());
        let mut regs = self.registrations.write();
        if !self.closed.load(Ordering::SeqCst) {
            regs.insert(id, tx);
        }
        rx
    }

    /// Disconnect every registration and refuse new ones.
    pub fn close(&self) {
        let mut regs = self.registrations.write();
        self.closed.store(true, Ordering::SeqCst);
        regs.clear();
    }

    /// Drop the registration; the worker's receiver disconnects.
    pub fn unregister(&self, id: SubscriptionId) {
        self.registrations.write().remove(&id);
    }

    pub fn registered(&self) -> usize {
        self.registrations.read().len()
    }

    /// Signal every registered subscription.
    pub fn wake_all(&self) {
        let mut gone = Vec::new();
        {
            let regs = self.registrations.read();
            for (id, tx) in regs.iter() {
                match tx.try_send(()) {
                    // Already signalled, the pending wake-up covers this change.
                    Ok(()) | Err(TrySendError::Full(())) => {}
                    Err(TrySendError::Disconnected(())) => gone.push(*id),
                }
            }
        }

        if !gone.is_empty() {
            let mut regs = self.registrations.write();
            for id in gone {
                regs.remove(&id);
            }
        }
    }

    /// React to one change signal.
    pub fn dispatch(&self, signal: Signal) {
        trace!(?signal, "change signal");
        match signal {
            Signal::NewFacts { .. } => self.wake_all(),
            Signal::Blacklist => self.blacklist.refresh_or_log(),
            Signal::Schema => self.transformer.resolver().clear(),
            Signal::Changed => {
                self.blacklist.refresh_or_log();
                self.transformer.resolver().clear();
                self.wake_all();
            }
        }
    }

    /// Dispatch signals from `signals` on a background thread until stopped.
    pub fn listen(notifier: &Arc<Self>, signals: Receiver<Signal>) -> ListenerHandle {
        let (stop, stopped) = bounded::<()>(0);
        let notifier = Arc::clone(notifier);

        let handle = thread::spawn(move || {
            debug!("change listener started");
            loop {
                select! {
                    recv(signals) -> signal => match signal {
                        Ok(signal) => notifier.dispatch(signal),
                        Err(_) => break,
                    },
                    recv(stopped) -> _ => break,
                }
            }
            debug!("change listener stopped");
        });

        ListenerHandle {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

/// Running change listener. Dropping it stops the thread.
pub struct ListenerHandle {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("change listener panicked");
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
