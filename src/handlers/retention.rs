//! `retention.purge`: delete completed units past the retention window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::WorkStore;
use crate::worker::{Handler, HandlerError, UnitContext};

pub const KIND: &str = "retention.purge";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeRequest {
    pub older_than_secs: u64,
}

impl PurgeRequest {
    pub fn older_than(retention: Duration) -> Self {
        Self {
            older_than_secs: retention.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeReport {
    pub purged: u64,
    pub cutoff: DateTime<Utc>,
}

/// Purges completed units through the store it runs against.
pub struct PurgeHandler<S: WorkStore> {
    store: Arc<S>,
}

impl<S: WorkStore> PurgeHandler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: WorkStore + 'static> Handler for PurgeHandler<S> {
    type Input = PurgeRequest;
    type Output = PurgeReport;

    fn kind(&self) -> &'static str {
        KIND
    }

    async fn handle(
        &self,
        input: PurgeRequest,
        _ctx: &UnitContext,
    ) -> Result<PurgeReport, HandlerError> {
        let age = chrono::Duration::try_seconds(i64::try_from(input.older_than_secs).unwrap_or(i64::MAX))
            .ok_or_else(|| {
                HandlerError::permanent(anyhow::anyhow!(
                    "older_than_secs {} is out of range",
                    input.older_than_secs
                ))
            })?;
        let cutoff = Utc::now() - age;

        let purged = self
            .store
            .purge_completed(cutoff)
            .await
            .map_err(HandlerError::retryable)?;

        tracing::info!(purged, cutoff = %cutoff, "purged completed units");
        Ok(PurgeReport { purged, cutoff })
    }
}
