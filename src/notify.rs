//! Change notifications between storage and its readers.
//!
//! Signals carry no facts. A reader woken by a signal re-queries storage for
//! whatever it needs, so a lost or coalesced signal never loses data.

use crate::types::Serial;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use tracing::trace;

/// A "something changed" notification, optionally tagged for routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Facts were committed; `max_serial` is the newest serial at commit time.
    NewFacts { max_serial: Serial },
    /// The blacklist table changed.
    Blacklist,
    /// Schemas or transformation steps changed.
    Schema,
    /// Untagged change. Receivers treat it as every kind at once.
    Changed,
}

/// Fan-out of [`Signal`]s to any number of listeners.
pub struct ChangeBus {
    listeners: RwLock<Vec<Sender<Signal>>>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener. Dropping the receiver unregisters it on the next publish.
    pub fn subscribe(&self) -> Receiver<Signal> {
        let (tx, rx) = unbounded();
        self.listeners.write().push(tx);
        rx
    }

    /// Deliver `signal` to every live listener.
    pub fn publish(&self, signal: Signal) {
        // Sends on unbounded channels never block, so holding the lock is fine.
        self.listeners
            .write()
            .retain(|listener| listener.send(signal).is_ok());
        trace!(?signal, "published change signal");
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}
