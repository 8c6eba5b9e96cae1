//! Leased work queue in the shared store.

pub mod sqlite_store;
pub mod store;
pub mod unit;

pub use sqlite_store::SqliteWorkStore;
pub use store::WorkStore;
pub use unit::{
    AttemptOutcome, AttemptRecord, Claim, ClaimedUnit, CompleteOutcome, Completion, Enqueued,
    FailOutcome, Failure, NewUnit, ReclaimReport, RequeueOutcome, StateCounts, StoreError,
    UnitFilter, UnitId, UnitState, WorkUnit,
};
