//! Subscriptions: ordered catchup over the log, then live delivery.
//!
//! A subscription replays every matching fact after its start position in
//! serial order, signals `on_catchup`, and then either completes or keeps
//! following new commits until closed.
//!
//! # Example
//!
//! ```ignore
//! let (observer, events) = ChannelObserver::new();
//! let sub = store.subscribe(
//!     SubscriptionRequest::follow(vec![FactSpec::ns("orders")]),
//!     Arc::new(observer),
//! )?;
//!
//! for event in events.iter() {
//!     match event {
//!         SubscriptionEvent::Fact(fact) => println!("{} {}", fact.serial, fact.fact_type),
//!         SubscriptionEvent::Catchup => println!("now live"),
//!         SubscriptionEvent::Error(e) => break,
//!         _ => {}
//!     }
//! }
//! sub.close();
//! ```

mod catchup;
mod engine;
mod live;
mod pipeline;
mod types;

pub use catchup::{CatchupProgress, CatchupSource};
pub use engine::{Subscription, SubscriptionEngine};
pub use live::{ListenerHandle, LiveNotifier};
pub use pipeline::{CatchupStrategy, FactPipeline, PipelineContext};
pub use types::{
    ChannelObserver, StartPosition, SubscriptionEvent, SubscriptionId, SubscriptionObserver,
    SubscriptionRequest, SubscriptionState,
};
