//! Work unit types shared by every process.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub i64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a unit as stored.
///
/// A retryable failure is not stored as its own state: the unit returns to
/// `Pending` with a later `available_at`, and the attempt log records
/// [`AttemptOutcome::FailedRetryable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Claimed,
    Completed,
    FailedTerminal,
}

impl UnitState {
    pub const ALL: [UnitState; 4] = [
        Self::Pending,
        Self::Claimed,
        Self::Completed,
        Self::FailedTerminal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::FailedTerminal => "failed_terminal",
        }
    }

    /// Pending or claimed units still hold their dedupe key.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, Self::Pending | Self::Claimed)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "completed" => Ok(Self::Completed),
            "failed_terminal" | "failed" => Ok(Self::FailedTerminal),
            other => Err(StoreError::Corrupt(format!("unknown unit state {other:?}"))),
        }
    }
}

/// A unit as stored, for inspection by the API, bot and CLI.
#[derive(Debug, Clone, Serialize)]
pub struct WorkUnit {
    pub id: UnitId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub state: UnitState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A unit to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewUnit {
    pub kind: String,
    pub payload: serde_json::Value,
    /// Overrides the store's default retry bound.
    pub max_attempts: Option<u32>,
    /// At most one outstanding unit per `(kind, dedupe_key)`.
    pub dedupe_key: Option<String>,
    /// Earliest claim time relative to enqueue.
    pub delay: Duration,
}

impl NewUnit {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            max_attempts: None,
            dedupe_key: None,
            delay: Duration::ZERO,
        }
    }

    /// Build a unit from any serializable payload.
    pub fn from_serializable<T: Serialize>(
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<Self, StoreError> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "id", rename_all = "snake_case")]
pub enum Enqueued {
    Created(UnitId),
    /// An outstanding unit with the same kind and dedupe key already exists.
    Duplicate(UnitId),
}

impl Enqueued {
    pub fn id(&self) -> UnitId {
        match self {
            Self::Created(id) | Self::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Proof of an active claim. Every state transition made on behalf of the
/// claimant is fenced on `token`, so a claimant whose lease expired and whose
/// unit was claimed again cannot overwrite the newer claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub unit_id: UnitId,
    pub worker: String,
    pub token: i64,
    pub attempt: u32,
}

/// A unit handed to a worker by `claim`.
#[derive(Debug, Clone)]
pub struct ClaimedUnit {
    pub claim: Claim,
    pub kind: String,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
    pub lease_expires_at: DateTime<Utc>,
}

impl ClaimedUnit {
    pub fn id(&self) -> UnitId {
        self.claim.unit_id
    }

    /// True when this is the last attempt the retry bound allows.
    pub fn is_final_attempt(&self) -> bool {
        self.claim.attempt >= self.max_attempts
    }
}

/// Outcome written when a unit completes.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub result: Option<serde_json::Value>,
    /// Units enqueued in the same transaction as the completion.
    pub follow_ups: Vec<NewUnit>,
}

impl Completion {
    pub fn with_result(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            follow_ups: Vec::new(),
        }
    }
}

/// Result of `complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompleteOutcome {
    Applied { follow_ups: Vec<Enqueued> },
    /// The unit was already completed under this claim; nothing changed.
    AlreadyCompleted,
    /// The claim is no longer the active one; nothing changed.
    ClaimLost,
}

/// A failed attempt.
#[derive(Debug, Clone)]
pub struct Failure {
    pub message: String,
    pub retryable: bool,
    /// Backoff before the unit may be claimed again.
    pub retry_after: Duration,
}

impl Failure {
    pub fn retryable(message: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            retry_after,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            retry_after: Duration::ZERO,
        }
    }
}

/// Result of `fail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { available_at: DateTime<Utc> },
    Terminal,
    ClaimLost,
}

/// Result of `requeue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued,
    NotFound,
    /// Only terminally failed units can be requeued.
    NotFailed(UnitState),
    /// Another outstanding unit holds the same dedupe key.
    DuplicateOutstanding,
}

/// Units moved by a lease sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub requeued: u64,
    pub failed: u64,
}

impl ReclaimReport {
    pub fn total(&self) -> u64 {
        self.requeued + self.failed
    }
}

/// Unit counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed_terminal: u64,
}

impl StateCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.completed + self.failed_terminal
    }

    pub(crate) fn add(&mut self, state: UnitState, n: u64) {
        match state {
            UnitState::Pending => self.pending += n,
            UnitState::Claimed => self.claimed += n,
            UnitState::Completed => self.completed += n,
            UnitState::FailedTerminal => self.failed_terminal += n,
        }
    }
}

/// Filter for `list`. Newest units first.
#[derive(Debug, Clone)]
pub struct UnitFilter {
    pub state: Option<UnitState>,
    pub kind: Option<String>,
    pub limit: u32,
}

impl Default for UnitFilter {
    fn default() -> Self {
        Self {
            state: None,
            kind: None,
            limit: 50,
        }
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Completed,
    FailedRetryable,
    FailedTerminal,
    LeaseExpired,
    Released,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedTerminal => "failed_terminal",
            Self::LeaseExpired => "lease_expired",
            Self::Released => "released",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed_retryable" => Ok(Self::FailedRetryable),
            "failed_terminal" => Ok(Self::FailedTerminal),
            "lease_expired" => Ok(Self::LeaseExpired),
            "released" => Ok(Self::Released),
            other => Err(StoreError::Corrupt(format!(
                "unknown attempt outcome {other:?}"
            ))),
        }
    }
}

/// One row of a unit's attempt log. `outcome` is `None` while in flight.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// Position in the log, starting at 1. Released claims keep their number.
    pub attempt: u32,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<AttemptOutcome>,
    pub error: Option<String>,
}

/// Error type for store operations.
///
/// Contention (another worker winning a claim) is never an error.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_text() {
        for state in UnitState::ALL {
            assert_eq!(state.as_str().parse::<UnitState>().unwrap(), state);
        }
        assert!("running".parse::<UnitState>().is_err());
    }

    #[test]
    fn outstanding_states() {
        assert!(UnitState::Pending.is_outstanding());
        assert!(UnitState::Claimed.is_outstanding());
        assert!(!UnitState::Completed.is_outstanding());
        assert!(!UnitState::FailedTerminal.is_outstanding());
    }

    #[test]
    fn new_unit_builder() {
        let unit = NewUnit::new("email", serde_json::json!({"to": "a@b"}))
            .max_attempts(2)
            .dedupe_key("a@b")
            .delay(Duration::from_secs(5));
        assert_eq!(unit.max_attempts, Some(2));
        assert_eq!(unit.dedupe_key.as_deref(), Some("a@b"));
        assert_eq!(unit.delay, Duration::from_secs(5));
    }

    #[test]
    fn enqueued_serializes_with_status() {
        let json = serde_json::to_value(Enqueued::Duplicate(UnitId(7))).unwrap();
        assert_eq!(json, serde_json::json!({"status": "duplicate", "id": 7}));
    }
}
