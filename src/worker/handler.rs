//! Handler trait and error types.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::queue::{Completion, NewUnit, UnitId};

/// Error returned by a handler.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Transient failure - worth retrying.
    #[error("retryable: {0:#}")]
    Retryable(#[source] anyhow::Error),

    /// Permanent failure - won't succeed on retry.
    #[error("permanent: {0:#}")]
    Permanent(#[source] anyhow::Error),
}

impl HandlerError {
    /// Create a retryable error.
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    /// Create a permanent error.
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// The underlying error chain, as stored in `last_error`.
    pub fn message(&self) -> String {
        match self {
            Self::Retryable(e) | Self::Permanent(e) => format!("{e:#}"),
        }
    }
}

/// What a handler knows about the unit it is running.
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub unit_id: UnitId,
    pub kind: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub worker_id: String,
    /// Cancelled when the worker gives up waiting for this unit at shutdown.
    pub cancel: CancellationToken,
}

impl UnitContext {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Processes units of one kind.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Payload type, decoded from the unit's JSON.
    type Input: DeserializeOwned + Send;

    /// Result type, stored as the unit's JSON result.
    type Output: Serialize + Send + Sync;

    /// The unit kind this handler processes.
    fn kind(&self) -> &'static str;

    /// Process one unit.
    async fn handle(
        &self,
        input: Self::Input,
        ctx: &UnitContext,
    ) -> Result<Self::Output, HandlerError>;

    /// Units to enqueue atomically with this unit's completion.
    fn follow_ups(&self, _output: &Self::Output) -> Vec<NewUnit> {
        Vec::new()
    }
}

/// Type-erased handler that can be stored in a registry.
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Run with a JSON payload and produce the completion to record.
    async fn handle_erased(
        &self,
        payload: serde_json::Value,
        ctx: &UnitContext,
    ) -> Result<Completion, HandlerError>;
}

/// Wrapper that implements ErasedHandler for a concrete Handler.
pub struct HandlerWrapper<H>(pub H);

#[async_trait]
impl<H> ErasedHandler for HandlerWrapper<H>
where
    H: Handler + 'static,
{
    fn kind(&self) -> &'static str {
        self.0.kind()
    }

    async fn handle_erased(
        &self,
        payload: serde_json::Value,
        ctx: &UnitContext,
    ) -> Result<Completion, HandlerError> {
        let input: H::Input = serde_json::from_value(payload).map_err(|e| {
            HandlerError::permanent(anyhow::anyhow!("invalid {} payload: {e}", self.0.kind()))
        })?;

        let output = self.0.handle(input, ctx).await?;
        let follow_ups = self.0.follow_ups(&output);
        let result = serde_json::to_value(&output).map_err(|e| {
            HandlerError::permanent(anyhow::anyhow!("cannot encode {} result: {e}", self.0.kind()))
        })?;

        Ok(Completion {
            result: Some(result).filter(|r| !r.is_null()),
            follow_ups,
        })
    }
}
