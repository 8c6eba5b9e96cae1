//! Applies revisions to the store, one atomic step at a time.

use sqlx::{Executor, SqliteConnection, SqlitePool};
use tracing::{info, warn};

use super::revision::{RevisionId, RevisionSet, Target};
use super::MigrationError;
use crate::db::now_millis;

pub(crate) const VERSION_TABLE: &str = "jobgate_schema_version";

const VERSION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobgate_schema_version (
    singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
    revision TEXT NOT NULL,
    applied_at INTEGER NOT NULL
)
"#;

/// Direction of a single applied step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Up,
    Down,
}

/// A revision applied or reverted by the migrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub revision: RevisionId,
    pub slug: String,
    pub direction: StepDirection,
}

/// One line of `history` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionStatus {
    pub id: RevisionId,
    pub slug: String,
    pub applied: bool,
    pub current: bool,
}

/// Read the store's current revision. `None` means nothing has been applied.
///
/// This is the only read runtime processes perform on the version record.
pub async fn current_revision(pool: &SqlitePool) -> Result<Option<RevisionId>, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    read_current(&mut conn).await
}

async fn read_current(conn: &mut SqliteConnection) -> Result<Option<RevisionId>, sqlx::Error> {
    let table: Option<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(VERSION_TABLE)
            .fetch_optional(&mut *conn)
            .await?;
    if table.is_none() {
        return Ok(None);
    }

    let revision: Option<String> =
        sqlx::query_scalar("SELECT revision FROM jobgate_schema_version WHERE singleton = 1")
            .fetch_optional(&mut *conn)
            .await?;
    Ok(revision.map(RevisionId))
}

async fn write_current(
    conn: &mut SqliteConnection,
    revision: Option<&RevisionId>,
) -> Result<(), sqlx::Error> {
    match revision {
        Some(id) => {
            sqlx::query(
                r#"
                INSERT INTO jobgate_schema_version (singleton, revision, applied_at)
                VALUES (1, ?, ?)
                ON CONFLICT(singleton) DO UPDATE
                SET revision = excluded.revision, applied_at = excluded.applied_at
                "#,
            )
            .bind(id.as_str())
            .bind(now_millis())
            .execute(&mut *conn)
            .await?;
        }
        None => {
            sqlx::query("DELETE FROM jobgate_schema_version")
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

/// Moves the store forward and backward through a [`RevisionSet`].
pub struct Migrator {
    pool: SqlitePool,
    revisions: RevisionSet,
}

impl Migrator {
    pub fn new(pool: SqlitePool, revisions: RevisionSet) -> Self {
        Self { pool, revisions }
    }

    pub fn revisions(&self) -> &RevisionSet {
        &self.revisions
    }

    /// Current revision, verified to belong to this revision set.
    pub async fn current(&self) -> Result<Option<RevisionId>, MigrationError> {
        let current = current_revision(&self.pool).await?;
        if let Some(id) = &current {
            if self.revisions.position(id).is_none() {
                return Err(MigrationError::UnknownRevision(id.clone()));
            }
        }
        Ok(current)
    }

    /// Every revision in authored order with applied/current markers.
    pub async fn history(&self) -> Result<Vec<RevisionStatus>, MigrationError> {
        let pos = self.current_position().await?;
        Ok(self
            .revisions
            .revisions()
            .iter()
            .enumerate()
            .map(|(i, rev)| RevisionStatus {
                id: rev.id.clone(),
                slug: rev.slug.clone(),
                applied: (i as i64) <= pos,
                current: (i as i64) == pos,
            })
            .collect())
    }

    /// Apply pending revisions up to and including `target`.
    pub async fn upgrade(&self, target: &Target) -> Result<Vec<Step>, MigrationError> {
        self.ensure_version_table().await?;
        let cur = self.current_position().await?;
        let to = self.resolve_upgrade(target, cur)?;

        let mut applied = Vec::new();
        for idx in (cur + 1)..=to {
            applied.push(self.apply(idx as usize, StepDirection::Up).await?);
        }
        if applied.is_empty() {
            info!(target = %target, "store already at requested revision");
        }
        Ok(applied)
    }

    /// Revert revisions in reverse order down to `target`.
    pub async fn downgrade(&self, target: &Target) -> Result<Vec<Step>, MigrationError> {
        self.ensure_version_table().await?;
        let cur = self.current_position().await?;
        let to = self.resolve_downgrade(target, cur)?;

        let mut reverted = Vec::new();
        let mut idx = cur;
        while idx > to {
            reverted.push(self.apply(idx as usize, StepDirection::Down).await?);
            idx -= 1;
        }
        if reverted.is_empty() {
            info!(target = %target, "store already at requested revision");
        }
        Ok(reverted)
    }

    async fn ensure_version_table(&self) -> Result<(), MigrationError> {
        sqlx::query(VERSION_SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Position of the current revision, `-1` at base.
    async fn current_position(&self) -> Result<i64, MigrationError> {
        Ok(match self.current().await? {
            Some(id) => self.revisions.position(&id).map(|p| p as i64).unwrap_or(-1),
            None => -1,
        })
    }

    fn resolve_upgrade(&self, target: &Target, cur: i64) -> Result<i64, MigrationError> {
        let last = self.revisions.len() as i64 - 1;
        let to = match target {
            Target::Head => last,
            Target::Base => -1,
            Target::Revision(id) => self.position_of(id)?,
            Target::Relative(n) if *n < 0 => {
                return Err(MigrationError::InvalidTarget(format!(
                    "{target} is a downgrade step"
                )))
            }
            Target::Relative(n) => cur + n,
        };
        if to > last {
            return Err(MigrationError::InvalidTarget(format!(
                "{target} is past the head revision"
            )));
        }
        if to < cur {
            return Err(MigrationError::InvalidTarget(format!(
                "{target} is behind the current revision; use downgrade"
            )));
        }
        Ok(to)
    }

    fn resolve_downgrade(&self, target: &Target, cur: i64) -> Result<i64, MigrationError> {
        let to = match target {
            Target::Base => -1,
            Target::Head => {
                return Err(MigrationError::InvalidTarget(
                    "head is not a downgrade target".to_string(),
                ))
            }
            Target::Revision(id) => self.position_of(id)?,
            Target::Relative(n) if *n > 0 => {
                return Err(MigrationError::InvalidTarget(format!(
                    "{target} is an upgrade step"
                )))
            }
            Target::Relative(n) => cur + n,
        };
        if to < -1 {
            return Err(MigrationError::InvalidTarget(format!(
                "{target} goes below base"
            )));
        }
        if to > cur {
            return Err(MigrationError::InvalidTarget(format!(
                "{target} is ahead of the current revision; use upgrade"
            )));
        }
        Ok(to)
    }

    fn position_of(&self, id: &RevisionId) -> Result<i64, MigrationError> {
        self.revisions
            .position(id)
            .map(|p| p as i64)
            .ok_or_else(|| MigrationError::InvalidTarget(format!("unknown revision {id}")))
    }

    /// Apply one revision inside its own write transaction.
    async fn apply(&self, idx: usize, direction: StepDirection) -> Result<Step, MigrationError> {
        let mut conn = self.pool.acquire().await?;

        // IMMEDIATE takes the write lock up front so two runners cannot both
        // read the same predecessor and race to apply the step.
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = self.apply_locked(&mut conn, idx, direction).await;
        let result = match result {
            Ok(step) => match sqlx::query("COMMIT").execute(&mut *conn).await {
                Ok(_) => Ok(step),
                Err(source) => Err(MigrationError::Failed {
                    revision: step.revision,
                    source,
                }),
            },
            Err(e) => Err(e),
        };

        if result.is_err() {
            if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                warn!(error = %e, "rollback after failed revision did not complete");
                conn.close_on_drop();
            }
        }

        let step = result?;
        info!(
            revision = %step.revision,
            slug = %step.slug,
            direction = ?step.direction,
            "revision applied"
        );
        Ok(step)
    }

    async fn apply_locked(
        &self,
        conn: &mut SqliteConnection,
        idx: usize,
        direction: StepDirection,
    ) -> Result<Step, MigrationError> {
        let revs = self.revisions.revisions();
        let rev = &revs[idx];
        let previous = idx.checked_sub(1).map(|p| &revs[p].id);

        let (expected, script, after) = match direction {
            StepDirection::Up => (previous, rev.up.as_str(), Some(&rev.id)),
            StepDirection::Down => (Some(&rev.id), rev.down.as_str(), previous),
        };

        let found = read_current(conn).await?;
        if found.as_ref() != expected {
            return Err(MigrationError::ConcurrentMigration {
                revision: rev.id.clone(),
                expected: label(expected),
                found: label(found.as_ref()),
            });
        }

        // SQLite parses the script itself, so trigger bodies and string
        // literals containing `;` survive intact.
        if !script.trim().is_empty() {
            conn.execute(sqlx::raw_sql(script))
                .await
                .map_err(|source| MigrationError::Failed {
                    revision: rev.id.clone(),
                    source,
                })?;
        }

        write_current(conn, after)
            .await
            .map_err(|source| MigrationError::Failed {
                revision: rev.id.clone(),
                source,
            })?;

        Ok(Step {
            revision: rev.id.clone(),
            slug: rev.slug.clone(),
            direction,
        })
    }
}

fn label(id: Option<&RevisionId>) -> String {
    id.map(|r| r.to_string()).unwrap_or_else(|| "base".to_string())
}
