//! The per-fact path shared by catchup and live delivery.
//!
//! Blacklist, then matcher, then transformation. Catchup and follow both go
//! through [`FactPipeline::process`], so a fact is treated the same way on
//! either side of the transition.

use super::types::SubscriptionRequest;
use crate::blacklist::Blacklist;
use crate::error::{FactCastError, MatchError, SubscriptionError};
use crate::matcher::{FactSpecsMatcher, ScriptEngine, VersionMatch};
use crate::storage::{FactStorage, RowShape, ScanPage};
use crate::transform::{FactTransformerService, RequestedVersions};
use crate::types::{Fact, Serial};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Collaborators every subscription pipeline needs.
pub struct PipelineContext {
    pub storage: Arc<dyn FactStorage>,
    pub blacklist: Arc<Blacklist>,
    pub scripts: Arc<ScriptEngine>,
    pub transformer: Arc<FactTransformerService>,
    pub page_size: usize,
}

/// How rows are fetched and delivered, chosen once per subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatchupStrategy {
    /// Full rows, transformed into the requested version.
    Paged,
    /// Headers only. Payloads are fetched only when a filter script needs them.
    IdOnly { fetch_payload: bool },
}

impl CatchupStrategy {
    fn row_shape(self) -> RowShape {
        match self {
            CatchupStrategy::Paged | CatchupStrategy::IdOnly { fetch_payload: true } => {
                RowShape::Full
            }
            CatchupStrategy::IdOnly { fetch_payload: false } => RowShape::HeaderOnly,
        }
    }
}

/// Compiled filter and delivery settings of one subscription.
pub struct FactPipeline {
    ctx: Arc<PipelineContext>,
    request: SubscriptionRequest,
    matcher: FactSpecsMatcher,
    requested: RequestedVersions,
    strategy: CatchupStrategy,
    storage_filters: bool,
}

impl FactPipeline {
    pub fn new(ctx: Arc<PipelineContext>, request: SubscriptionRequest) -> Result<Self, MatchError> {
        let matcher = FactSpecsMatcher::new(&request.specs, &ctx.scripts, VersionMatch::Transformable)?;
        let strategy = if request.id_only {
            CatchupStrategy::IdOnly {
                fetch_payload: matcher.needs_payload(),
            }
        } else {
            CatchupStrategy::Paged
        };
        let storage_filters = ctx.storage.filters_completely(&request.specs);
        let requested = RequestedVersions::from_specs(&request.specs);

        Ok(Self {
            ctx,
            request,
            matcher,
            requested,
            strategy,
            storage_filters,
        })
    }

    pub fn strategy(&self) -> CatchupStrategy {
        self.strategy
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Next page of candidates after `after`.
    pub fn fetch_page(&self, after: Serial) -> Result<ScanPage, FactCastError> {
        self.ctx.storage.range_scan(
            &self.request.specs,
            after,
            self.ctx.page_size,
            self.strategy.row_shape(),
        )
    }

    /// The fact as it must be delivered, or `None` if it must not be delivered.
    pub fn process(
        &self,
        fact: Fact,
        blacklist: &HashSet<Uuid>,
    ) -> Result<Option<Fact>, SubscriptionError> {
        if blacklist.contains(&fact.id) {
            return Ok(None);
        }
        if !self.storage_filters && !self.matcher.test(&fact)? {
            return Ok(None);
        }

        match self.strategy {
            CatchupStrategy::IdOnly { .. } => {
                let mut header = fact;
                header.payload = Value::Null;
                Ok(Some(header))
            }
            CatchupStrategy::Paged => {
                let (fact_id, serial) = (fact.id, fact.serial);
                self.ctx
                    .transformer
                    .transform_requested(fact, &self.requested)
                    .map(Some)
                    .map_err(|source| SubscriptionError::Transformation {
                        fact_id,
                        serial,
                        source,
                    })
            }
        }
    }
}
