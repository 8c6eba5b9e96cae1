//! SQLite implementation of WorkStore.
//!
//! Every write path is a single transaction whose first statement is a write,
//! so SQLite takes the database write lock up front and concurrent writers in
//! other processes wait on `busy_timeout` instead of failing a lock upgrade.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use super::store::WorkStore;
use super::unit::{
    AttemptOutcome, AttemptRecord, Claim, ClaimedUnit, CompleteOutcome, Completion, Enqueued,
    FailOutcome, Failure, NewUnit, ReclaimReport, RequeueOutcome, StateCounts, StoreError,
    UnitFilter, UnitId, UnitState, WorkUnit,
};
use crate::db::{duration_millis, from_millis, now_millis};

const UNIT_COLUMNS: &str = "id, kind, payload, state, attempts, max_attempts, claimed_by, \
    lease_expires_at, available_at, last_error, result, dedupe_key, created_at, updated_at, \
    completed_at";

/// SQLite-backed work store.
#[derive(Clone)]
pub struct SqliteWorkStore {
    pool: SqlitePool,
    default_max_attempts: u32,
}

impl SqliteWorkStore {
    /// Create a store over a pool whose schema is already at head.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            default_max_attempts: 5,
        }
    }

    /// Retry bound for units enqueued without their own.
    pub fn with_default_max_attempts(mut self, n: u32) -> Self {
        self.default_max_attempts = n.max(1);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl WorkStore for SqliteWorkStore {
    async fn enqueue(&self, unit: NewUnit) -> Result<Enqueued, StoreError> {
        let mut tx = self.pool.begin().await?;
        let enqueued = insert_unit(&mut tx, &unit, self.default_max_attempts, now_millis()).await?;
        tx.commit().await?;
        Ok(enqueued)
    }

    async fn claim(
        &self,
        worker: &str,
        kinds: &[&str],
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedUnit>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let now = now_millis();
        let expires = now.saturating_add(duration_millis(lease));

        let mut tx = self.pool.begin().await?;

        let swept = sweep_expired(&mut tx, now).await?;
        if swept.total() > 0 {
            info!(
                worker,
                requeued = swept.requeued,
                failed = swept.failed,
                "swept expired leases"
            );
        }

        // Candidates are selected and claimed by one statement; the outer
        // state check keeps a unit from being claimed twice.
        let kind_clause = if kinds.is_empty() {
            String::new()
        } else {
            let placeholders: Vec<String> =
                (0..kinds.len()).map(|i| format!("?{}", i + 5)).collect();
            format!("AND kind IN ({})", placeholders.join(", "))
        };
        let sql = format!(
            r#"
            UPDATE work_units
            SET state = 'claimed',
                attempts = attempts + 1,
                claim_token = claim_token + 1,
                claimed_by = ?2,
                lease_expires_at = ?3,
                updated_at = ?1
            WHERE state = 'pending' AND id IN (
                SELECT id FROM work_units
                WHERE state = 'pending' AND available_at <= ?1 {kind_clause}
                ORDER BY available_at, id
                LIMIT ?4
            )
            RETURNING id, kind, payload, attempts, max_attempts, claim_token
            "#
        );

        let mut query = sqlx::query_as::<_, (i64, String, String, i64, i64, i64)>(&sql)
            .bind(now)
            .bind(worker)
            .bind(expires)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX));
        for kind in kinds {
            query = query.bind(*kind);
        }
        let mut rows = query.fetch_all(&mut *tx).await?;
        rows.sort_by_key(|row| row.0);

        // Log rows are numbered per unit, independent of the `attempts`
        // counter that release and requeue wind back.
        for &(id, ..) in &rows {
            sqlx::query(
                r#"
                INSERT INTO work_attempts (unit_id, attempt, worker_id, claimed_at)
                SELECT ?1, COALESCE(MAX(attempt), 0) + 1, ?2, ?3
                FROM work_attempts WHERE unit_id = ?1
                "#,
            )
            .bind(id)
            .bind(worker)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        if !rows.is_empty() {
            debug!(worker, count = rows.len(), "claimed units");
        }

        Ok(rows
            .into_iter()
            .map(
                |(id, kind, payload, attempts, max_attempts, token)| ClaimedUnit {
                    claim: Claim {
                        unit_id: UnitId(id),
                        worker: worker.to_string(),
                        token,
                        attempt: to_u32(attempts),
                    },
                    kind,
                    // A payload that is not valid JSON reaches the handler as
                    // a string and fails its decoding permanently.
                    payload: serde_json::from_str(&payload)
                        .unwrap_or(serde_json::Value::String(payload)),
                    max_attempts: to_u32(max_attempts),
                    lease_expires_at: from_millis(expires),
                },
            )
            .collect())
    }

    async fn complete(
        &self,
        claim: &Claim,
        completion: Completion,
    ) -> Result<CompleteOutcome, StoreError> {
        let now = now_millis();
        let result = completion
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE work_units
            SET state = 'completed',
                result = ?3,
                lease_expires_at = NULL,
                last_error = NULL,
                completed_at = ?4,
                updated_at = ?4
            WHERE id = ?1 AND state = 'claimed' AND claim_token = ?2
            "#,
        )
        .bind(claim.unit_id.0)
        .bind(claim.token)
        .bind(result)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let row: Option<(String, i64)> =
                sqlx::query_as("SELECT state, claim_token FROM work_units WHERE id = ?1")
                    .bind(claim.unit_id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(match row {
                Some((state, token)) if state == "completed" && token == claim.token => {
                    CompleteOutcome::AlreadyCompleted
                }
                _ => CompleteOutcome::ClaimLost,
            });
        }

        finish_attempt(&mut tx, claim, now, AttemptOutcome::Completed, None).await?;

        let mut follow_ups = Vec::with_capacity(completion.follow_ups.len());
        for unit in &completion.follow_ups {
            follow_ups.push(insert_unit(&mut tx, unit, self.default_max_attempts, now).await?);
        }

        tx.commit().await?;
        Ok(CompleteOutcome::Applied { follow_ups })
    }

    async fn fail(&self, claim: &Claim, failure: Failure) -> Result<FailOutcome, StoreError> {
        let now = now_millis();
        let retry_at = now.saturating_add(duration_millis(failure.retry_after));

        let mut tx = self.pool.begin().await?;

        let row: Option<(String, i64)> = sqlx::query_as(
            r#"
            UPDATE work_units
            SET state = CASE WHEN ?3 AND attempts < max_attempts
                             THEN 'pending' ELSE 'failed_terminal' END,
                available_at = CASE WHEN ?3 AND attempts < max_attempts
                                    THEN ?4 ELSE available_at END,
                last_error = ?5,
                lease_expires_at = NULL,
                updated_at = ?6
            WHERE id = ?1 AND state = 'claimed' AND claim_token = ?2
            RETURNING state, available_at
            "#,
        )
        .bind(claim.unit_id.0)
        .bind(claim.token)
        .bind(failure.retryable)
        .bind(retry_at)
        .bind(&failure.message)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((state, available_at)) = row else {
            tx.rollback().await?;
            return Ok(FailOutcome::ClaimLost);
        };

        let (outcome, attempt_outcome) = if state == UnitState::Pending.as_str() {
            (
                FailOutcome::Retrying {
                    available_at: from_millis(available_at),
                },
                AttemptOutcome::FailedRetryable,
            )
        } else {
            (FailOutcome::Terminal, AttemptOutcome::FailedTerminal)
        };

        finish_attempt(&mut tx, claim, now, attempt_outcome, Some(&failure.message)).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn release(&self, claim: &Claim) -> Result<bool, StoreError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let released = sqlx::query(
            r#"
            UPDATE work_units
            SET state = 'pending',
                attempts = MAX(attempts - 1, 0),
                lease_expires_at = NULL,
                available_at = ?3,
                updated_at = ?3
            WHERE id = ?1 AND state = 'claimed' AND claim_token = ?2
            "#,
        )
        .bind(claim.unit_id.0)
        .bind(claim.token)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if released == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        finish_attempt(&mut tx, claim, now, AttemptOutcome::Released, None).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn reclaim_expired(&self) -> Result<ReclaimReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let report = sweep_expired(&mut tx, now_millis()).await?;
        tx.commit().await?;
        Ok(report)
    }

    async fn get(&self, id: UnitId) -> Result<Option<WorkUnit>, StoreError> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM work_units WHERE id = ?1");
        let row: Option<UnitRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WorkUnit::try_from).transpose()
    }

    async fn list(&self, filter: &UnitFilter) -> Result<Vec<WorkUnit>, StoreError> {
        let sql = format!(
            r#"
            SELECT {UNIT_COLUMNS} FROM work_units
            WHERE (?1 IS NULL OR state = ?1) AND (?2 IS NULL OR kind = ?2)
            ORDER BY id DESC
            LIMIT ?3
            "#
        );
        let rows: Vec<UnitRow> = sqlx::query_as(&sql)
            .bind(filter.state.map(|s| s.as_str()))
            .bind(filter.kind.as_deref())
            .bind(i64::from(filter.limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(WorkUnit::try_from).collect()
    }

    async fn stats(&self) -> Result<StateCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM work_units GROUP BY state")
                .fetch_all(&self.pool)
                .await?;
        let mut counts = StateCounts::default();
        for (state, n) in rows {
            counts.add(state.parse()?, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn attempts(&self, id: UnitId) -> Result<Vec<AttemptRecord>, StoreError> {
        let rows: Vec<(i64, String, i64, Option<i64>, Option<String>, Option<String>)> =
            sqlx::query_as(
                r#"
                SELECT attempt, worker_id, claimed_at, finished_at, outcome, error
                FROM work_attempts
                WHERE unit_id = ?1
                ORDER BY id
                "#,
            )
            .bind(id.0)
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (attempt, worker_id, claimed_at, finished_at, outcome, error) in rows {
            records.push(AttemptRecord {
                attempt: to_u32(attempt),
                worker_id,
                claimed_at: from_millis(claimed_at),
                finished_at: finished_at.map(from_millis),
                outcome: outcome.map(|o| o.parse()).transpose()?,
                error,
            });
        }
        Ok(records)
    }

    async fn requeue(&self, id: UnitId) -> Result<RequeueOutcome, StoreError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE work_units
            SET state = 'pending',
                attempts = 0,
                claimed_by = NULL,
                lease_expires_at = NULL,
                available_at = ?2,
                updated_at = ?2
            WHERE id = ?1 AND state = 'failed_terminal'
            "#,
        )
        .bind(id.0)
        .bind(now)
        .execute(&mut *tx)
        .await;

        let updated = match updated {
            Ok(done) => done.rows_affected(),
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                return Ok(RequeueOutcome::DuplicateOutstanding);
            }
            Err(e) => return Err(e.into()),
        };

        if updated == 0 {
            let state: Option<String> =
                sqlx::query_scalar("SELECT state FROM work_units WHERE id = ?1")
                    .bind(id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(match state {
                None => RequeueOutcome::NotFound,
                Some(state) => RequeueOutcome::NotFailed(state.parse()?),
            });
        }

        tx.commit().await?;
        info!(unit = id.0, "terminal unit requeued");
        Ok(RequeueOutcome::Requeued)
    }

    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = before.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM work_attempts WHERE unit_id IN (
                SELECT id FROM work_units WHERE state = 'completed' AND completed_at < ?1
            )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let purged = sqlx::query(
            "DELETE FROM work_units WHERE state = 'completed' AND completed_at < ?1",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(purged)
    }
}

/// Insert a unit, honouring its dedupe key against outstanding units.
async fn insert_unit(
    conn: &mut SqliteConnection,
    unit: &NewUnit,
    default_max_attempts: u32,
    now: i64,
) -> Result<Enqueued, StoreError> {
    let payload = serde_json::to_string(&unit.payload)?;
    let max_attempts = unit.max_attempts.unwrap_or(default_max_attempts).max(1);
    let available_at = now.saturating_add(duration_millis(unit.delay));

    let id: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO work_units
            (kind, payload, state, attempts, max_attempts, available_at, created_at, updated_at, dedupe_key)
        VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?5, ?5, ?6)
        ON CONFLICT DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&unit.kind)
    .bind(payload)
    .bind(max_attempts)
    .bind(available_at)
    .bind(now)
    .bind(unit.dedupe_key.as_deref())
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(id) = id {
        return Ok(Enqueued::Created(UnitId(id)));
    }

    let existing: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM work_units
        WHERE kind = ?1 AND dedupe_key = ?2 AND state IN ('pending', 'claimed')
        ORDER BY id
        LIMIT 1
        "#,
    )
    .bind(&unit.kind)
    .bind(unit.dedupe_key.as_deref())
    .fetch_optional(&mut *conn)
    .await?;

    existing
        .map(|id| Enqueued::Duplicate(UnitId(id)))
        .ok_or_else(|| StoreError::Corrupt(format!("insert of {} ignored without a duplicate", unit.kind)))
}

/// Return expired claims to `pending`, or fail them when the expired attempt
/// was the last one allowed.
async fn sweep_expired(conn: &mut SqliteConnection, now: i64) -> Result<ReclaimReport, sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE work_attempts
        SET finished_at = ?1, outcome = 'lease_expired', error = 'lease expired'
        WHERE finished_at IS NULL AND unit_id IN (
            SELECT id FROM work_units WHERE state = 'claimed' AND lease_expires_at <= ?1
        )
        "#,
    )
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let failed = sqlx::query(
        r#"
        UPDATE work_units
        SET state = 'failed_terminal',
            last_error = 'lease expired on final attempt',
            lease_expires_at = NULL,
            updated_at = ?1
        WHERE state = 'claimed' AND lease_expires_at <= ?1 AND attempts >= max_attempts
        "#,
    )
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    let requeued = sqlx::query(
        r#"
        UPDATE work_units
        SET state = 'pending',
            last_error = 'lease expired',
            lease_expires_at = NULL,
            available_at = ?1,
            updated_at = ?1
        WHERE state = 'claimed' AND lease_expires_at <= ?1
        "#,
    )
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(ReclaimReport { requeued, failed })
}

/// Close the open log row of `claim`. Only called after the fenced update of
/// the unit succeeded, so the single open row belongs to this claim.
async fn finish_attempt(
    conn: &mut SqliteConnection,
    claim: &Claim,
    now: i64,
    outcome: AttemptOutcome,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE work_attempts
        SET finished_at = ?3, outcome = ?4, error = ?5
        WHERE unit_id = ?1 AND worker_id = ?2 AND finished_at IS NULL
        "#,
    )
    .bind(claim.unit_id.0)
    .bind(&claim.worker)
    .bind(now)
    .bind(outcome.as_str())
    .bind(error)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|e| e.is_unique_violation())
}

fn to_u32(n: i64) -> u32 {
    u32::try_from(n).unwrap_or(if n < 0 { 0 } else { u32::MAX })
}

#[derive(sqlx::FromRow)]
struct UnitRow {
    id: i64,
    kind: String,
    payload: String,
    state: String,
    attempts: i64,
    max_attempts: i64,
    claimed_by: Option<String>,
    lease_expires_at: Option<i64>,
    available_at: i64,
    last_error: Option<String>,
    result: Option<String>,
    dedupe_key: Option<String>,
    created_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
}

impl TryFrom<UnitRow> for WorkUnit {
    type Error = StoreError;

    fn try_from(row: UnitRow) -> Result<Self, Self::Error> {
        Ok(WorkUnit {
            id: UnitId(row.id),
            kind: row.kind,
            payload: serde_json::from_str(&row.payload)?,
            state: row.state.parse()?,
            attempts: to_u32(row.attempts),
            max_attempts: to_u32(row.max_attempts),
            claimed_by: row.claimed_by,
            lease_expires_at: row.lease_expires_at.map(from_millis),
            available_at: from_millis(row.available_at),
            last_error: row.last_error,
            result: row.result.map(|r| serde_json::from_str(&r)).transpose()?,
            dedupe_key: row.dedupe_key,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
            completed_at: row.completed_at.map(from_millis),
        })
    }
}
