//! Subscription request, observer and event types.

use crate::error::SubscriptionError;
use crate::types::{Fact, FactSpec, Serial};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Where catchup starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Replay the whole log.
    #[default]
    FromScratch,
    /// Replay everything after this serial.
    AfterSerial(Serial),
    /// Replay everything after the fact with this id.
    AfterId(Uuid),
}

/// What a consumer wants to receive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Filter clauses, ORed.
    pub specs: Vec<FactSpec>,

    #[serde(default)]
    pub start: StartPosition,

    /// Keep delivering new facts after catchup.
    #[serde(default)]
    pub continuous: bool,

    /// Skip catchup and only deliver facts committed after subscribing.
    #[serde(default)]
    pub ephemeral: bool,

    /// Deliver headers only (payload is `Null`, no transformation).
    #[serde(default)]
    pub id_only: bool,

    /// Free-form label used in logs.
    #[serde(default)]
    pub debug_info: String,
}

impl SubscriptionRequest {
    /// Bounded replay: catchup, then complete.
    pub fn catchup(specs: Vec<FactSpec>) -> Self {
        Self {
            specs,
            start: StartPosition::FromScratch,
            continuous: false,
            ephemeral: false,
            id_only: false,
            debug_info: String::new(),
        }
    }

    /// Catchup followed by live delivery until closed.
    pub fn follow(specs: Vec<FactSpec>) -> Self {
        Self {
            continuous: true,
            ..Self::catchup(specs)
        }
    }

    pub fn from_scratch(mut self) -> Self {
        self.start = StartPosition::FromScratch;
        self
    }

    pub fn after_serial(mut self, serial: Serial) -> Self {
        self.start = StartPosition::AfterSerial(serial);
        self
    }

    pub fn after_id(mut self, id: Uuid) -> Self {
        self.start = StartPosition::AfterId(id);
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn id_only(mut self) -> Self {
        self.id_only = true;
        self
    }

    pub fn debug_info(mut self, info: impl Into<String>) -> Self {
        self.debug_info = info.into();
        self
    }
}

/// Receives the output of a subscription.
///
/// Bounded subscriptions see `on_next* on_catchup on_complete`; continuous
/// ones see `on_next* on_catchup on_next*`. `on_error` is terminal.
/// Calls for one subscription come from one thread, in order.
pub trait SubscriptionObserver: Send + Sync {
    fn on_next(&self, fact: Fact);

    /// Historical replay finished.
    fn on_catchup(&self) {}

    /// Bounded subscription finished.
    fn on_complete(&self) {}

    /// Everything up to `serial` was scanned without a match.
    fn on_fast_forward(&self, _serial: Serial) {}

    fn on_error(&self, error: SubscriptionError);
}

/// Subscription output as channel messages.
#[derive(Debug)]
pub enum SubscriptionEvent {
    Fact(Fact),
    Catchup,
    Complete,
    FastForward(Serial),
    Error(SubscriptionError),
}

/// Observer forwarding everything into a channel.
pub struct ChannelObserver {
    sender: Sender<SubscriptionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, Receiver<SubscriptionEvent>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }

    fn send(&self, event: SubscriptionEvent) {
        // The consumer went away; the subscription notices on close.
        let _ = self.sender.send(event);
    }
}

impl SubscriptionObserver for ChannelObserver {
    fn on_next(&self, fact: Fact) {
        self.send(SubscriptionEvent::Fact(fact));
    }

    fn on_catchup(&self) {
        self.send(SubscriptionEvent::Catchup);
    }

    fn on_complete(&self) {
        self.send(SubscriptionEvent::Complete);
    }

    fn on_fast_forward(&self, serial: Serial) {
        self.send(SubscriptionEvent::FastForward(serial));
    }

    fn on_error(&self, error: SubscriptionError) {
        self.send(SubscriptionEvent::Error(error));
    }
}

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Starting,
    Catchup,
    Follow,
    Complete,
    Failed,
    Closed,
}

impl SubscriptionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubscriptionState::Complete | SubscriptionState::Failed | SubscriptionState::Closed
        )
    }
}
