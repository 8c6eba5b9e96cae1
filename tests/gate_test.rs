//! Tests for the startup schema gate.

use std::time::{Duration, Instant};

use jobgate::config::DatabaseSettings;
use jobgate::migrate::{current_revision, RevisionSet};
use jobgate::{db, gate, GateError, Migrator, Role, SchemaGate, SchemaState, Settings, Target};
use sqlx::SqlitePool;
use tempfile::TempDir;

fn url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("jobgate.db").display())
}

async fn open(dir: &TempDir) -> SqlitePool {
    db::connect(&DatabaseSettings::new(url(dir))).await.unwrap()
}

async fn migrate_to(pool: &SqlitePool, target: &str) {
    Migrator::new(pool.clone(), RevisionSet::embedded())
        .upgrade(&target.parse().unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_gate_passes_at_head() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    migrate_to(&pool, "head").await;

    let gate = SchemaGate::new(pool, Role::Worker, RevisionSet::embedded());
    assert_eq!(gate.state().await.unwrap(), SchemaState::Current);
    gate.check().await.unwrap();
}

#[tokio::test]
async fn test_gate_refuses_previous_revision() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    migrate_to(&pool, "0001").await;

    for role in [Role::Api, Role::Bot, Role::Worker] {
        let gate = SchemaGate::new(pool.clone(), role, RevisionSet::embedded());
        match gate.check().await {
            Err(GateError::SchemaMismatch {
                role: r,
                expected,
                found,
            }) => {
                assert_eq!(r, role);
                assert_eq!(expected, "0002");
                assert_eq!(found, "0001");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_gate_refuses_unmigrated_store_without_writing() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;

    let gate = SchemaGate::new(pool.clone(), Role::Api, RevisionSet::embedded());
    match gate.check().await {
        Err(GateError::SchemaMismatch { found, .. }) => assert_eq!(found, "base"),
        other => panic!("expected mismatch, got {other:?}"),
    }

    // The gate only reads.
    assert_eq!(current_revision(&pool).await.unwrap(), None);
    let tables: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(tables, 0);
}

#[tokio::test]
async fn test_wait_fails_fast_when_store_is_ahead() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    migrate_to(&pool, "head").await;

    // A binary built before revision 0002 existed.
    let older = RevisionSet::new(vec![RevisionSet::embedded().get(0).unwrap().clone()]).unwrap();
    let gate = SchemaGate::new(pool, Role::Worker, older);

    let started = Instant::now();
    let err = gate
        .wait(Duration::from_secs(10), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    match err {
        GateError::SchemaMismatch {
            expected, found, ..
        } => {
            assert_eq!(expected, "0001");
            assert_eq!(found, "0002");
        }
        other => panic!("expected mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_wait_succeeds_once_migration_lands() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    migrate_to(&pool, "0001").await;

    // The operator migrates from another process shortly after.
    let operator = open(&dir).await;
    let migration = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        migrate_to(&operator, "head").await;
    });

    let gate = SchemaGate::new(pool, Role::Api, RevisionSet::embedded());
    gate.wait(Duration::from_secs(10), Duration::from_millis(50))
        .await
        .unwrap();
    migration.await.unwrap();
}

#[tokio::test]
async fn test_wait_gives_up_after_deadline() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    migrate_to(&pool, "0001").await;

    let gate = SchemaGate::new(pool, Role::Bot, RevisionSet::embedded());
    let started = Instant::now();
    let err = gate
        .wait(Duration::from_millis(200), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(matches!(err, GateError::SchemaMismatch { .. }));
}

#[tokio::test]
async fn test_open_returns_pool_only_at_head() {
    let dir = TempDir::new().unwrap();
    let settings = Settings::for_database(url(&dir));

    let err = gate::open(Role::Api, &settings).await.unwrap_err();
    assert!(matches!(err, GateError::SchemaMismatch { .. }));

    let pool = open(&dir).await;
    Migrator::new(pool, RevisionSet::embedded())
        .upgrade(&Target::Head)
        .await
        .unwrap();

    let gated = gate::open(Role::Api, &settings).await.unwrap();
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_units")
        .fetch_one(&gated)
        .await
        .unwrap();
    assert_eq!(n, 0);
}
