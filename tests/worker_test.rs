//! Tests for the worker loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobgate::config::DatabaseSettings;
use jobgate::queue::AttemptOutcome;
use jobgate::{
    db, Handler, HandlerError, Migrator, NewUnit, RetryPolicy, RevisionSet, SchedulerBuilder,
    SqliteWorkStore, Target, UnitContext, UnitState, WorkStore, WorkerBuilder, WorkerError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn setup() -> (TempDir, SqliteWorkStore) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("jobgate.db").display());
    let pool = db::connect(&DatabaseSettings::new(url)).await.unwrap();
    Migrator::new(pool.clone(), RevisionSet::embedded())
        .upgrade(&Target::Head)
        .await
        .unwrap();
    (dir, SqliteWorkStore::new(pool))
}

#[derive(Debug, Serialize, Deserialize)]
struct Square {
    n: i64,
}

struct SquareHandler;

#[async_trait]
impl Handler for SquareHandler {
    type Input = Square;
    type Output = i64;

    fn kind(&self) -> &'static str {
        "square"
    }

    async fn handle(&self, input: Square, _ctx: &UnitContext) -> Result<i64, HandlerError> {
        Ok(input.n * input.n)
    }

    fn follow_ups(&self, output: &i64) -> Vec<NewUnit> {
        vec![NewUnit::new("report", json!({ "value": output }))]
    }
}

/// Fails with a retryable error every time and counts its calls.
struct Flaky {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for Flaky {
    type Input = serde_json::Value;
    type Output = ();

    fn kind(&self) -> &'static str {
        "flaky"
    }

    async fn handle(&self, _input: serde_json::Value, _ctx: &UnitContext) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::retryable(anyhow::anyhow!("upstream unavailable")))
    }
}

/// Panics on every call.
struct Crashing;

#[async_trait]
impl Handler for Crashing {
    type Input = serde_json::Value;
    type Output = ();

    fn kind(&self) -> &'static str {
        "crashing"
    }

    async fn handle(&self, _input: serde_json::Value, _ctx: &UnitContext) -> Result<(), HandlerError> {
        panic!("index out of range");
    }
}

/// Sleeps, tracking how many run at once.
struct Slow {
    duration: Duration,
    concurrent: Arc<AtomicUsize>,
    max_observed: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for Slow {
    type Input = serde_json::Value;
    type Output = ();

    fn kind(&self) -> &'static str {
        "slow"
    }

    async fn handle(&self, _input: serde_json::Value, _ctx: &UnitContext) -> Result<(), HandlerError> {
        let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.duration).await;
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn slow(duration: Duration) -> (Slow, Arc<AtomicUsize>) {
    let max_observed = Arc::new(AtomicUsize::new(0));
    (
        Slow {
            duration,
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_observed: max_observed.clone(),
        },
        max_observed,
    )
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_run_once_completes_unit_with_follow_ups() {
    let (_dir, store) = setup().await;
    let id = store
        .enqueue(NewUnit::new("square", json!({"n": 7})))
        .await
        .unwrap()
        .id();

    let worker = WorkerBuilder::new(store.clone())
        .worker_id("w1")
        .handler(SquareHandler)
        .build()
        .unwrap();

    assert_eq!(worker.run_once().await.unwrap(), 1);

    let unit = store.get(id).await.unwrap().unwrap();
    assert_eq!(unit.state, UnitState::Completed);
    assert_eq!(unit.result, Some(json!(49)));

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    // The follow-up has no handler here, so it waits for another worker.
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn test_worker_only_claims_its_kinds() {
    let (_dir, store) = setup().await;
    store
        .enqueue(NewUnit::new("someone_else", json!({})))
        .await
        .unwrap();

    let worker = WorkerBuilder::new(store.clone())
        .handler(SquareHandler)
        .build()
        .unwrap();
    assert_eq!(worker.run_once().await.unwrap(), 0);
    assert_eq!(store.stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_bad_payload_fails_terminally() {
    let (_dir, store) = setup().await;
    let id = store
        .enqueue(NewUnit::new("square", json!({"n": "seven"})).max_attempts(5))
        .await
        .unwrap()
        .id();

    let worker = WorkerBuilder::new(store.clone())
        .handler(SquareHandler)
        .build()
        .unwrap();
    worker.run_once().await.unwrap();

    let unit = store.get(id).await.unwrap().unwrap();
    assert_eq!(unit.state, UnitState::FailedTerminal);
    assert_eq!(unit.attempts, 1);
    assert!(unit.last_error.unwrap().contains("invalid square payload"));
}

#[tokio::test]
async fn test_retryable_errors_stop_at_the_bound() {
    let (_dir, store) = setup().await;
    let id = store
        .enqueue(NewUnit::new("flaky", json!({})).max_attempts(3))
        .await
        .unwrap()
        .id();

    let calls = Arc::new(AtomicUsize::new(0));
    let worker = WorkerBuilder::new(store.clone())
        .handler(Flaky {
            calls: calls.clone(),
        })
        .retry_policy(RetryPolicy::Immediate)
        .build()
        .unwrap();

    for _ in 0..5 {
        worker.run_once().await.unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let unit = store.get(id).await.unwrap().unwrap();
    assert_eq!(unit.state, UnitState::FailedTerminal);
    assert_eq!(unit.last_error.as_deref(), Some("upstream unavailable"));
}

#[tokio::test]
async fn test_handler_timeout_is_a_retryable_failure() {
    let (_dir, store) = setup().await;
    let id = store
        .enqueue(NewUnit::new("slow", json!({})).max_attempts(2))
        .await
        .unwrap()
        .id();

    let (handler, _) = slow(Duration::from_secs(5));
    let worker = WorkerBuilder::new(store.clone())
        .handler(handler)
        .handler_timeout(Duration::from_millis(100))
        .lease(Duration::from_secs(10))
        .retry_policy(RetryPolicy::fixed(Duration::from_secs(60)))
        .build()
        .unwrap();
    worker.run_once().await.unwrap();

    let unit = store.get(id).await.unwrap().unwrap();
    assert_eq!(unit.state, UnitState::Pending);
    assert!(unit.last_error.unwrap().contains("timed out"));
    assert!(unit.available_at > chrono::Utc::now());
}

#[tokio::test]
async fn test_build_rejects_timeout_not_below_lease() {
    let (_dir, store) = setup().await;
    let err = WorkerBuilder::new(store.clone())
        .handler(SquareHandler)
        .lease(Duration::from_secs(30))
        .handler_timeout(Duration::from_secs(30))
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, WorkerError::TimeoutNotBelowLease { .. }));

    let err = WorkerBuilder::new(store).build().err().unwrap();
    assert!(matches!(err, WorkerError::NoHandlers));
}

#[tokio::test]
async fn test_run_processes_until_cancelled() {
    let (_dir, store) = setup().await;
    for n in 0..10 {
        store
            .enqueue(NewUnit::new("square", json!({ "n": n })))
            .await
            .unwrap();
    }

    let worker = WorkerBuilder::new(store.clone())
        .handler(SquareHandler)
        .poll_interval(Duration::from_millis(20))
        .batch_size(3)
        .build()
        .unwrap();

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(token).await });

    let check = store.clone();
    wait_for(|| {
        let store = check.clone();
        async move { store.stats().await.unwrap().completed == 10 }
    })
    .await;

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_concurrency_limit_is_enforced() {
    let (_dir, store) = setup().await;
    for n in 0..6 {
        store
            .enqueue(NewUnit::new("slow", json!({ "n": n })))
            .await
            .unwrap();
    }

    let (handler, max_observed) = slow(Duration::from_millis(100));
    let worker = WorkerBuilder::new(store.clone())
        .handler(handler)
        .concurrency(2)
        .poll_interval(Duration::from_millis(10))
        .build()
        .unwrap();

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(token).await });

    let check = store.clone();
    wait_for(|| {
        let store = check.clone();
        async move { store.stats().await.unwrap().completed == 6 }
    })
    .await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert!(max_observed.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_shutdown_releases_units_still_running_after_grace() {
    let (_dir, store) = setup().await;
    let id = store
        .enqueue(NewUnit::new("slow", json!({})))
        .await
        .unwrap()
        .id();

    let (handler, _) = slow(Duration::from_secs(30));
    let worker = WorkerBuilder::new(store.clone())
        .handler(handler)
        .lease(Duration::from_secs(60))
        .handler_timeout(Duration::from_secs(45))
        .shutdown_grace(Duration::from_millis(100))
        .poll_interval(Duration::from_millis(10))
        .build()
        .unwrap();

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(token).await });

    let check = store.clone();
    wait_for(|| {
        let store = check.clone();
        async move { store.stats().await.unwrap().claimed == 1 }
    })
    .await;

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let unit = store.get(id).await.unwrap().unwrap();
    assert_eq!(unit.state, UnitState::Pending);
    assert_eq!(unit.attempts, 0);
    assert_eq!(
        store.attempts(id).await.unwrap()[0].outcome,
        Some(AttemptOutcome::Released)
    );
}

#[tokio::test]
async fn test_startup_reclaims_expired_leases() {
    let (_dir, store) = setup().await;
    let id = store
        .enqueue(NewUnit::new("square", json!({"n": 3})))
        .await
        .unwrap()
        .id();

    // A previous worker instance claimed the unit and crashed.
    store
        .claim("dead", &["square"], 1, Duration::from_millis(50))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let worker = WorkerBuilder::new(store.clone())
        .handler(SquareHandler)
        .poll_interval(Duration::from_millis(10))
        .build()
        .unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(token).await });

    let check = store.clone();
    wait_for(|| {
        let store = check.clone();
        async move { store.get(id).await.unwrap().unwrap().state == UnitState::Completed }
    })
    .await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let attempts = store.attempts(id).await.unwrap();
    assert_eq!(attempts[0].outcome, Some(AttemptOutcome::LeaseExpired));
    assert_eq!(attempts[1].outcome, Some(AttemptOutcome::Completed));
}

#[tokio::test]
async fn test_handler_panic_is_recorded_as_retryable_failure() {
    let (_dir, store) = setup().await;
    let id = store
        .enqueue(NewUnit::new("crashing", json!({})).max_attempts(2))
        .await
        .unwrap()
        .id();

    let worker = WorkerBuilder::new(store.clone())
        .handler(Crashing)
        .retry_policy(RetryPolicy::Immediate)
        .build()
        .unwrap();

    assert_eq!(worker.run_once().await.unwrap(), 1);
    let unit = store.get(id).await.unwrap().unwrap();
    assert_eq!(unit.state, UnitState::Pending);
    assert_eq!(unit.attempts, 1);
    let error = unit.last_error.unwrap();
    assert!(error.contains("handler panicked"));
    assert!(error.contains("index out of range"));
    let attempts = store.attempts(id).await.unwrap();
    assert_eq!(attempts[0].outcome, Some(AttemptOutcome::FailedRetryable));

    worker.run_once().await.unwrap();
    let unit = store.get(id).await.unwrap().unwrap();
    assert_eq!(unit.state, UnitState::FailedTerminal);
    assert_eq!(unit.attempts, 2);
    assert_eq!(
        store.attempts(id).await.unwrap()[1].outcome,
        Some(AttemptOutcome::FailedTerminal)
    );
}

#[tokio::test]
async fn test_panicking_unit_goes_terminal_across_worker_restarts() {
    let (_dir, store) = setup().await;
    let id = store
        .enqueue(NewUnit::new("crashing", json!({})).max_attempts(2))
        .await
        .unwrap()
        .id();

    for _ in 0..4 {
        let worker = WorkerBuilder::new(store.clone())
            .handler(Crashing)
            .retry_policy(RetryPolicy::Immediate)
            .poll_interval(Duration::from_millis(10))
            .shutdown_grace(Duration::from_millis(50))
            .build()
            .unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { worker.run(token).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    let unit = store.get(id).await.unwrap().unwrap();
    assert_eq!(unit.state, UnitState::FailedTerminal);
    assert_eq!(unit.attempts, 2);
    let outcomes: Vec<_> = store
        .attempts(id)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![
            Some(AttemptOutcome::FailedRetryable),
            Some(AttemptOutcome::FailedTerminal)
        ]
    );
}

#[tokio::test]
async fn test_worker_failure_stops_its_scheduler() {
    let (_dir, store) = setup().await;

    let worker = WorkerBuilder::new(store.clone())
        .handler(SquareHandler)
        .build()
        .unwrap();
    let scheduler = SchedulerBuilder::new(store.clone())
        .job("digest", Duration::from_millis(20), || async {
            vec!["tick".to_string()]
        })
        .build();

    // Startup reclaim cannot reach the store.
    store.pool().close().await;

    let shutdown = CancellationToken::new();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        worker.run_with_scheduler(&scheduler, shutdown.clone()),
    )
    .await
    .expect("worker and scheduler should stop together");

    assert!(matches!(result, Err(WorkerError::Store(_))));
    assert!(!shutdown.is_cancelled());
}

#[tokio::test]
async fn test_run_with_scheduler_stops_on_shutdown() {
    let (_dir, store) = setup().await;

    let worker = WorkerBuilder::new(store.clone())
        .handler(SquareHandler)
        .poll_interval(Duration::from_millis(10))
        .build()
        .unwrap();
    let scheduler = SchedulerBuilder::new(store.clone())
        .job("square", Duration::from_secs(60), || async {
            vec![json!({"n": 4})]
        })
        .run_on_start(true)
        .build();

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run_with_scheduler(&scheduler, token).await });

    let check = store.clone();
    wait_for(|| {
        let store = check.clone();
        async move { store.stats().await.unwrap().completed == 1 }
    })
    .await;

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}
