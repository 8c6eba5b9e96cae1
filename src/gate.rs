//! Startup schema gate.
//!
//! Every runtime process (API, bot, worker) opens the shared store through
//! [`open`]. The gate compares the store's current revision with the head
//! revision compiled into the binary and refuses to continue on mismatch.
//! Runtime processes never apply revisions themselves.

use std::fmt;
use std::time::Duration;

use sqlx::SqlitePool;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::Settings;
use crate::db;
use crate::migrate::{current_revision, MigrationError, RevisionId, RevisionSet};

/// The kind of process passing through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Api,
    Bot,
    Worker,
    /// Operator commands that read or edit units from a shell.
    Operator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Bot => "bot",
            Self::Worker => "worker",
            Self::Operator => "operator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a process may not start against the store.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("{role} expects schema revision {expected} but the store is at {found}; run `jobgate migrate upgrade`")]
    SchemaMismatch {
        role: Role,
        expected: String,
        found: String,
    },

    #[error("schema check failed: {0}")]
    Migration(#[from] MigrationError),

    #[error("cannot reach the store: {0}")]
    Connect(#[from] sqlx::Error),
}

/// Relation of the store's revision to the expected one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaState {
    Current,
    /// The store is at an earlier known revision (or base); a migration may
    /// still be on its way.
    Behind(Option<RevisionId>),
    /// The store is at a later or unknown revision; waiting cannot help.
    Ahead(RevisionId),
}

/// Compares the store's revision with the revision this binary expects.
pub struct SchemaGate {
    pool: SqlitePool,
    role: Role,
    revisions: RevisionSet,
}

impl SchemaGate {
    /// Gate against the head of `revisions`.
    pub fn new(pool: SqlitePool, role: Role, revisions: RevisionSet) -> Self {
        Self {
            pool,
            role,
            revisions,
        }
    }

    /// The revision this binary expects.
    pub fn expected(&self) -> Option<&RevisionId> {
        self.revisions.head()
    }

    /// Read the store and classify its revision.
    pub async fn state(&self) -> Result<SchemaState, GateError> {
        let found = current_revision(&self.pool).await?;
        let expected = self.expected();
        if found.as_ref() == expected {
            return Ok(SchemaState::Current);
        }

        let Some(found_id) = found else {
            return Ok(SchemaState::Behind(None));
        };
        let expected_pos = expected.and_then(|id| self.revisions.position(id));
        match (self.revisions.position(&found_id), expected_pos) {
            (Some(f), Some(e)) if f < e => Ok(SchemaState::Behind(Some(found_id))),
            _ => Ok(SchemaState::Ahead(found_id)),
        }
    }

    /// Fail unless the store is exactly at the expected revision.
    pub async fn check(&self) -> Result<(), GateError> {
        match self.state().await? {
            SchemaState::Current => {
                info!(role = %self.role, revision = %self.expected_label(), "schema gate passed");
                Ok(())
            }
            SchemaState::Behind(found) => Err(self.mismatch(found.as_ref())),
            SchemaState::Ahead(found) => Err(self.mismatch(Some(&found))),
        }
    }

    /// Like [`check`](Self::check), but when the store is behind keep polling
    /// until `deadline` has elapsed. A store that is ahead or unknown fails
    /// immediately. A zero deadline is the same as `check`.
    pub async fn wait(&self, deadline: Duration, poll: Duration) -> Result<(), GateError> {
        let until = Instant::now() + deadline;
        loop {
            match self.state().await? {
                SchemaState::Current => return self.check().await,
                SchemaState::Ahead(found) => return Err(self.mismatch(Some(&found))),
                SchemaState::Behind(found) => {
                    if Instant::now() >= until {
                        return Err(self.mismatch(found.as_ref()));
                    }
                    warn!(
                        role = %self.role,
                        expected = %self.expected_label(),
                        found = %label(found.as_ref()),
                        "store schema is behind, waiting for migration"
                    );
                    let remaining = until.saturating_duration_since(Instant::now());
                    tokio::time::sleep(poll.min(remaining)).await;
                }
            }
        }
    }

    fn expected_label(&self) -> String {
        label(self.expected())
    }

    fn mismatch(&self, found: Option<&RevisionId>) -> GateError {
        GateError::SchemaMismatch {
            role: self.role,
            expected: self.expected_label(),
            found: label(found),
        }
    }
}

fn label(id: Option<&RevisionId>) -> String {
    id.map(|r| r.to_string()).unwrap_or_else(|| "base".to_string())
}

/// Connect to the store and pass the gate for `role` using the revisions
/// compiled into this binary. Returns the pool on success.
pub async fn open(role: Role, settings: &Settings) -> Result<SqlitePool, GateError> {
    let pool = db::connect(&settings.database).await?;
    let gate = SchemaGate::new(pool.clone(), role, RevisionSet::embedded());
    let poll = Duration::from_millis(500).min(settings.schema_wait.max(Duration::from_millis(1)));
    if let Err(e) = gate.wait(settings.schema_wait, poll).await {
        pool.close().await;
        return Err(e);
    }
    Ok(pool)
}
