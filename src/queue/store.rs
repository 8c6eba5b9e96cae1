//! Work store trait.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::unit::{
    AttemptRecord, Claim, ClaimedUnit, CompleteOutcome, Completion, Enqueued, FailOutcome,
    Failure, NewUnit, ReclaimReport, RequeueOutcome, StateCounts, StoreError, UnitFilter, UnitId,
    WorkUnit,
};

/// Shared work queue. Every method is a single store transaction, so several
/// processes may use the same store concurrently.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Enqueue a unit in `pending`.
    async fn enqueue(&self, unit: NewUnit) -> Result<Enqueued, StoreError>;

    /// Claim up to `limit` claimable units of the given kinds (all kinds when
    /// `kinds` is empty) for `worker`, holding each for `lease`.
    ///
    /// Expired leases are swept first. Losing a race to another claimant
    /// yields fewer units, not an error.
    async fn claim(
        &self,
        worker: &str,
        kinds: &[&str],
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedUnit>, StoreError>;

    /// Mark a claimed unit completed, writing its result and follow-up units
    /// atomically. Safe to repeat.
    async fn complete(
        &self,
        claim: &Claim,
        completion: Completion,
    ) -> Result<CompleteOutcome, StoreError>;

    /// Record a failed attempt. Retryable failures below the retry bound go
    /// back to `pending`; everything else becomes terminal.
    async fn fail(&self, claim: &Claim, failure: Failure) -> Result<FailOutcome, StoreError>;

    /// Hand a claimed unit back without counting the attempt.
    /// Returns false when the claim was no longer active.
    async fn release(&self, claim: &Claim) -> Result<bool, StoreError>;

    /// Return units whose lease has expired to `pending`, or to
    /// `failed_terminal` when the expired attempt was the last allowed.
    async fn reclaim_expired(&self) -> Result<ReclaimReport, StoreError>;

    async fn get(&self, id: UnitId) -> Result<Option<WorkUnit>, StoreError>;

    async fn list(&self, filter: &UnitFilter) -> Result<Vec<WorkUnit>, StoreError>;

    async fn stats(&self) -> Result<StateCounts, StoreError>;

    /// Attempt log of a unit, oldest first.
    async fn attempts(&self, id: UnitId) -> Result<Vec<AttemptRecord>, StoreError>;

    /// Operator action: move a terminally failed unit back to `pending` with
    /// its attempt count reset.
    async fn requeue(&self, id: UnitId) -> Result<RequeueOutcome, StoreError>;

    /// Delete completed units finished before `before`. Returns the count.
    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}
