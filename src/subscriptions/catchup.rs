//! Bounded, ordered scans over the log.

use super::pipeline::FactPipeline;
use crate::error::SubscriptionError;
use crate::types::{Fact, Serial};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

/// Where a scan ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CatchupProgress {
    /// Highest serial examined. The next scan starts after it.
    pub position: Serial,
    /// Facts handed to the consumer.
    pub delivered: u64,
}

/// Streams everything after a position through a [`FactPipeline`], page by page.
///
/// Memory use is bounded by the page size. Cancellation is checked between
/// pages, never in the middle of one.
pub struct CatchupSource<'a> {
    pipeline: &'a FactPipeline,
    cancelled: &'a AtomicBool,
}

impl<'a> CatchupSource<'a> {
    pub fn new(pipeline: &'a FactPipeline, cancelled: &'a AtomicBool) -> Self {
        Self {
            pipeline,
            cancelled,
        }
    }

    /// Deliver every matching fact after `from`, in ascending serial order.
    ///
    /// Any per-fact error ends the scan; no fact is skipped.
    pub fn run(
        &self,
        from: Serial,
        deliver: &mut dyn FnMut(Fact),
    ) -> Result<CatchupProgress, SubscriptionError> {
        let mut progress = CatchupProgress {
            position: from,
            delivered: 0,
        };

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                break;
            }

            let page = self.pipeline.fetch_page(progress.position)?;
            let blacklist = self.pipeline.context().blacklist.snapshot();
            trace!(after = %progress.position, rows = page.facts.len(), "catchup page");

            for fact in page.facts {
                let serial = fact.serial;
                if let Some(out) = self.pipeline.process(fact, &blacklist)? {
                    deliver(out);
                    progress.delivered += 1;
                }
                progress.position = serial;
            }
            progress.position = progress.position.max(page.scanned_to);

            if page.exhausted {
                break;
            }
        }

        Ok(progress)
    }
}
