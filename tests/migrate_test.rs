//! Tests for the migration runner and revision autogeneration.

use jobgate::config::DatabaseSettings;
use jobgate::migrate::autogen::{self, LiveSchema};
use jobgate::migrate::{
    current_revision, MigrationError, Revision, RevisionId, RevisionSet, StepDirection,
};
use jobgate::{db, model, Migrator, Target};
use sqlx::SqlitePool;
use tempfile::TempDir;

async fn open(dir: &TempDir) -> SqlitePool {
    let url = format!("sqlite://{}", dir.path().join("jobgate.db").display());
    db::connect(&DatabaseSettings::new(url)).await.unwrap()
}

fn target(s: &str) -> Target {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_upgrade_from_base_to_head() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    let migrator = Migrator::new(pool.clone(), RevisionSet::embedded());

    assert_eq!(migrator.current().await.unwrap(), None);

    let steps = migrator.upgrade(&Target::Head).await.unwrap();
    let ids: Vec<_> = steps.iter().map(|s| s.revision.as_str()).collect();
    assert_eq!(ids, vec!["0001", "0002"]);
    assert!(steps.iter().all(|s| s.direction == StepDirection::Up));

    assert_eq!(
        current_revision(&pool).await.unwrap(),
        Some(RevisionId::from("0002"))
    );

    let schema = LiveSchema::introspect(&pool).await.unwrap();
    assert!(schema.tables.contains_key("work_units"));
    assert!(schema.tables.contains_key("work_attempts"));
    assert!(!schema.tables.contains_key("jobgate_schema_version"));

    // Already at head
    assert!(migrator.upgrade(&Target::Head).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_upgrade_and_downgrade_round_trip_each_revision() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    let migrator = Migrator::new(pool.clone(), RevisionSet::embedded());

    for _ in 0..migrator.revisions().len() {
        let before = LiveSchema::introspect(&pool).await.unwrap();
        let revision_before = migrator.current().await.unwrap();

        migrator.upgrade(&target("+1")).await.unwrap();
        let reverted = migrator.downgrade(&target("-1")).await.unwrap();
        assert_eq!(reverted.len(), 1);
        assert_eq!(reverted[0].direction, StepDirection::Down);

        let after = LiveSchema::introspect(&pool).await.unwrap();
        assert_eq!(before.structure(), after.structure());
        assert_eq!(migrator.current().await.unwrap(), revision_before);

        // Move on to the next revision
        migrator.upgrade(&target("+1")).await.unwrap();
    }

    assert_eq!(
        migrator.current().await.unwrap(),
        Some(RevisionId::from("0002"))
    );
}

#[tokio::test]
async fn test_downgrade_to_base_removes_everything() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    let migrator = Migrator::new(pool.clone(), RevisionSet::embedded());

    migrator.upgrade(&Target::Head).await.unwrap();
    let steps = migrator.downgrade(&Target::Base).await.unwrap();
    let ids: Vec<_> = steps.iter().map(|s| s.revision.as_str()).collect();
    assert_eq!(ids, vec!["0002", "0001"]);

    assert_eq!(migrator.current().await.unwrap(), None);
    assert!(LiveSchema::introspect(&pool).await.unwrap().tables.is_empty());
}

#[tokio::test]
async fn test_downgrade_keeps_data_of_remaining_revisions() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    let migrator = Migrator::new(pool.clone(), RevisionSet::embedded());
    migrator.upgrade(&Target::Head).await.unwrap();

    sqlx::query(
        "INSERT INTO work_units (kind, payload, max_attempts, available_at, created_at, updated_at, dedupe_key)
         VALUES ('k', '{}', 3, 0, 0, 0, 'key')",
    )
    .execute(&pool)
    .await
    .unwrap();

    migrator.downgrade(&target("0001")).await.unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_units")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_targets_on_the_wrong_side_are_rejected() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    let migrator = Migrator::new(pool.clone(), RevisionSet::embedded());
    migrator.upgrade(&target("0001")).await.unwrap();

    assert!(matches!(
        migrator.upgrade(&target("-1")).await,
        Err(MigrationError::InvalidTarget(_))
    ));
    assert!(matches!(
        migrator.upgrade(&target("+5")).await,
        Err(MigrationError::InvalidTarget(_))
    ));
    assert!(matches!(
        migrator.downgrade(&target("+1")).await,
        Err(MigrationError::InvalidTarget(_))
    ));
    assert!(matches!(
        migrator.downgrade(&target("0002")).await,
        Err(MigrationError::InvalidTarget(_))
    ));
    assert!(matches!(
        migrator.upgrade(&target("9999")).await,
        Err(MigrationError::InvalidTarget(_))
    ));
    assert!(matches!(
        migrator.downgrade(&target("-2")).await,
        Err(MigrationError::InvalidTarget(_))
    ));

    // Nothing moved
    assert_eq!(
        migrator.current().await.unwrap(),
        Some(RevisionId::from("0001"))
    );
}

#[tokio::test]
async fn test_failed_revision_rolls_back() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    let revisions = RevisionSet::new(vec![
        Revision::new("0001", "a", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;"),
        Revision::new(
            "0002",
            "broken",
            "CREATE TABLE b (id INTEGER);\nINSERT INTO missing VALUES (1);",
            "DROP TABLE b;",
        ),
    ])
    .unwrap();
    let migrator = Migrator::new(pool.clone(), revisions);

    let err = migrator.upgrade(&Target::Head).await.unwrap_err();
    match err {
        MigrationError::Failed { revision, .. } => assert_eq!(revision.as_str(), "0002"),
        other => panic!("expected Failed, got {other:?}"),
    }

    assert_eq!(
        migrator.current().await.unwrap(),
        Some(RevisionId::from("0001"))
    );
    let schema = LiveSchema::introspect(&pool).await.unwrap();
    assert!(schema.tables.contains_key("a"));
    assert!(!schema.tables.contains_key("b"));
}

#[tokio::test]
async fn test_revision_with_trigger_body_and_semicolon_literal() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    let revisions = RevisionSet::new(vec![Revision::new(
        "0001",
        "audit",
        r#"
-- Trigger body and default both contain ';'.
CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL DEFAULT 'a;b');
CREATE TABLE note_log (note_id INTEGER NOT NULL, action TEXT NOT NULL);
CREATE TRIGGER notes_logged AFTER INSERT ON notes
BEGIN
    INSERT INTO note_log (note_id, action) VALUES (NEW.id, 'insert;');
    UPDATE notes SET body = body || ';' WHERE id = NEW.id;
END;
"#,
        "DROP TRIGGER notes_logged;\nDROP TABLE note_log;\nDROP TABLE notes;",
    )])
    .unwrap();
    let migrator = Migrator::new(pool.clone(), revisions);

    migrator.upgrade(&Target::Head).await.unwrap();

    sqlx::query("INSERT INTO notes (id) VALUES (1)")
        .execute(&pool)
        .await
        .unwrap();
    let body: String = sqlx::query_scalar("SELECT body FROM notes WHERE id = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(body, "a;b;");
    let action: String = sqlx::query_scalar("SELECT action FROM note_log WHERE note_id = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(action, "insert;");

    migrator.downgrade(&Target::Base).await.unwrap();
    let schema = LiveSchema::introspect(&pool).await.unwrap();
    assert!(!schema.tables.contains_key("notes"));
    assert!(!schema.tables.contains_key("note_log"));
}

#[tokio::test]
async fn test_concurrent_migrators_apply_each_revision_once() {
    let dir = TempDir::new().unwrap();
    // Two independent pools stand in for two operator shells.
    let first = Migrator::new(open(&dir).await, RevisionSet::embedded());
    let second = Migrator::new(open(&dir).await, RevisionSet::embedded());

    let (a, b) = tokio::join!(first.upgrade(&Target::Head), second.upgrade(&Target::Head));

    let mut applied = 0;
    for result in [a, b] {
        match result {
            Ok(steps) => applied += steps.len(),
            Err(MigrationError::ConcurrentMigration { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert!(applied <= 2);

    // Whoever lost can simply run again.
    first.upgrade(&Target::Head).await.unwrap();
    second.upgrade(&Target::Head).await.unwrap();
    assert_eq!(
        first.current().await.unwrap(),
        Some(RevisionId::from("0002"))
    );
}

#[tokio::test]
async fn test_store_ahead_of_revision_set_is_reported() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    Migrator::new(pool.clone(), RevisionSet::embedded())
        .upgrade(&Target::Head)
        .await
        .unwrap();

    let older = RevisionSet::new(vec![RevisionSet::embedded().get(0).unwrap().clone()]).unwrap();
    let migrator = Migrator::new(pool, older);
    assert!(matches!(
        migrator.current().await,
        Err(MigrationError::UnknownRevision(_))
    ));
}

#[tokio::test]
async fn test_history_marks_applied_revisions() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    let migrator = Migrator::new(pool, RevisionSet::embedded());
    migrator.upgrade(&target("0001")).await.unwrap();

    let history = migrator.history().await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].applied && history[0].current);
    assert!(!history[1].applied && !history[1].current);
}

#[tokio::test]
async fn test_autogenerate_is_empty_at_head() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    Migrator::new(pool.clone(), RevisionSet::embedded())
        .upgrade(&Target::Head)
        .await
        .unwrap();

    let live = LiveSchema::introspect(&pool).await.unwrap();
    assert!(autogen::diff(model::declared(), &live).is_empty());

    let out = TempDir::new().unwrap();
    let generated = autogen::generate(out.path(), "nothing changed", model::declared(), Some(&pool))
        .await
        .unwrap();
    assert_eq!(generated.changes, 0);
    assert_eq!(generated.id.as_str(), "0001");
    assert!(generated
        .up_path
        .ends_with("0001_nothing_changed.up.sql"));
}

#[tokio::test]
async fn test_autogenerated_revision_reaches_declared_model() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;

    // Empty store: everything must be created.
    let out = TempDir::new().unwrap();
    let generated = autogen::generate(out.path(), "initial", model::declared(), Some(&pool))
        .await
        .unwrap();
    assert!(generated.changes > 0);

    let up = std::fs::read_to_string(&generated.up_path).unwrap();
    assert!(up.starts_with("-- initial"));
    assert!(up.contains("CREATE TABLE work_units"));

    // Apply the generated revision and diff again.
    let revisions = RevisionSet::from_dir(out.path()).unwrap();
    let migrator = Migrator::new(pool.clone(), revisions);
    migrator.upgrade(&Target::Head).await.unwrap();

    let live = LiveSchema::introspect(&pool).await.unwrap();
    assert!(autogen::diff(model::declared(), &live).is_empty());

    // And its down script returns to an empty store.
    migrator.downgrade(&Target::Base).await.unwrap();
    assert!(LiveSchema::introspect(&pool).await.unwrap().tables.is_empty());
}

#[tokio::test]
async fn test_autogenerate_detects_missing_revision() {
    let dir = TempDir::new().unwrap();
    let pool = open(&dir).await;
    Migrator::new(pool.clone(), RevisionSet::embedded())
        .upgrade(&target("0001"))
        .await
        .unwrap();

    let live = LiveSchema::introspect(&pool).await.unwrap();
    let changes = autogen::diff(model::declared(), &live);
    let (up, down) = autogen::render(&changes);

    assert!(up.contains("CREATE TABLE work_attempts"));
    assert!(up.contains("ALTER TABLE work_units ADD COLUMN dedupe_key TEXT"));
    assert!(up.contains("CREATE UNIQUE INDEX idx_work_units_dedupe"));
    assert!(down.contains("DROP TABLE work_attempts"));
    assert!(down.contains("ALTER TABLE work_units DROP COLUMN dedupe_key"));
}
