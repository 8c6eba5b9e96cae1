//! # jobgate
//!
//! Shared-store coordination for independently started processes.
//!
//! An API server, a Telegram bot and a background worker run as separate
//! processes against one SQLite store. Nothing passes between them except
//! through that store, so this crate provides the pieces that keep them
//! consistent:
//!
//! - **Revisions** - [`migrate`] moves the store forward and backward through
//!   an ordered set of schema revisions, one atomic step at a time.
//! - **Startup gate** - [`gate::open`] refuses to start a process whose
//!   compiled-in head revision differs from the store's.
//! - **Leased queue** - [`queue`] hands each unit of work to at most one
//!   worker at a time, recovers crashed claims by lease expiry, bounds retries
//!   and makes completion idempotent.
//! - **Worker** - [`worker`] claims units and runs typed [`Handler`]s.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use jobgate::{gate, Role, Settings, SqliteWorkStore, WorkerBuilder};
//!
//! let settings = Settings::from_env()?;
//! let pool = gate::open(Role::Worker, &settings).await?;
//!
//! let worker = WorkerBuilder::new(SqliteWorkStore::new(pool))
//!     .settings(&settings.worker)
//!     .handler(SendDigest)
//!     .build()?;
//!
//! worker.run(shutdown).await?;
//! ```

pub mod config;
pub mod db;
pub mod gate;
pub mod handlers;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use config::{ConfigError, Settings};
pub use gate::{GateError, Role, SchemaGate, SchemaState};
pub use migrate::{MigrationError, Migrator, RevisionId, RevisionSet, Target};
pub use queue::{
    Claim, ClaimedUnit, CompleteOutcome, Completion, Enqueued, FailOutcome, Failure, NewUnit,
    SqliteWorkStore, StoreError, UnitFilter, UnitId, UnitState, WorkStore, WorkUnit,
};
pub use retry::RetryPolicy;
pub use scheduler::{PeriodicScheduler, SchedulerBuilder};
pub use worker::{Handler, HandlerError, UnitContext, Worker, WorkerBuilder, WorkerError};
