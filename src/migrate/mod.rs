//! Schema revisions and the migration runner.
//!
//! The store's current revision lives in a single-row table that only the
//! [`Migrator`] writes. Runtime processes read it through
//! [`current_revision`] (see [`crate::gate`]).

pub mod autogen;
mod revision;
mod runner;

pub use revision::{Revision, RevisionId, RevisionSet, Target};
pub use runner::{current_revision, Migrator, RevisionStatus, Step, StepDirection};

use thiserror::Error;

/// Error returned by migration operations.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("store is at revision {0}, which this revision set does not contain")]
    UnknownRevision(RevisionId),

    #[error("invalid migration target: {0}")]
    InvalidTarget(String),

    #[error("invalid revision set: {0}")]
    InvalidRevisionSet(String),

    #[error("revision {revision} expected the store at {expected}, found {found}; another migration ran concurrently")]
    ConcurrentMigration {
        revision: RevisionId,
        expected: String,
        found: String,
    },

    #[error("revision {revision} failed and was rolled back: {source}")]
    Failed {
        revision: RevisionId,
        #[source]
        source: sqlx::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}
