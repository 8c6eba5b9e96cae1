use crate::queue::{NewUnit, WorkStore};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Type-erased query function that returns JSON values.
pub(crate) type QueryFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Vec<serde_json::Value>> + Send>> + Send + Sync>;

/// A registered job configuration.
pub(crate) struct RegisteredJob {
    pub kind: &'static str,
    pub interval: Duration,
    pub query_fn: QueryFn,
    pub run_on_start: bool,
    pub dedupe: bool,
}

/// Periodic scheduler that enqueues units for registered jobs at intervals.
pub struct PeriodicScheduler<S: WorkStore> {
    store: Arc<S>,
    jobs: Vec<Arc<RegisteredJob>>,
}

impl<S: WorkStore + 'static> PeriodicScheduler<S> {
    pub(crate) fn new(store: S, jobs: Vec<RegisteredJob>) -> Self {
        Self {
            store: Arc::new(store),
            jobs: jobs.into_iter().map(Arc::new).collect(),
        }
    }

    /// Run all jobs until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut handles = JoinSet::new();
        for job in &self.jobs {
            let store = self.store.clone();
            let job = job.clone();
            let shutdown = shutdown.clone();
            handles.spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = Self::run_job(store, job) => {}
                }
            });
        }

        while handles.join_next().await.is_some() {}
        debug!("scheduler stopped");
    }

    /// Run every job's query once and enqueue the results. Returns the number
    /// of units created.
    pub async fn tick_all(&self) -> usize {
        let mut created = 0;
        for job in &self.jobs {
            created += Self::execute_job(&self.store, job).await;
        }
        created
    }

    async fn run_job(store: Arc<S>, job: Arc<RegisteredJob>) {
        info!(
            kind = job.kind,
            interval_secs = job.interval.as_secs(),
            run_on_start = job.run_on_start,
            dedupe = job.dedupe,
            "Starting scheduled job"
        );

        if job.run_on_start {
            Self::execute_job(&store, &job).await;
        }

        let mut ticker = interval(job.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // Consume immediate first tick

        loop {
            ticker.tick().await;
            Self::execute_job(&store, &job).await;
        }
    }

    async fn execute_job(store: &Arc<S>, job: &RegisteredJob) -> usize {
        debug!(kind = job.kind, "Executing scheduled job query");

        let items = (job.query_fn)().await;

        if items.is_empty() {
            debug!(kind = job.kind, "No items to enqueue");
            return 0;
        }

        let mut created = 0;
        let mut duplicates = 0;
        for item in items {
            let mut unit = NewUnit::new(job.kind, item);
            if job.dedupe {
                unit.dedupe_key = Some(unit.payload.to_string());
            }
            match store.enqueue(unit).await {
                Ok(enqueued) if enqueued.is_created() => created += 1,
                Ok(_) => duplicates += 1,
                Err(e) => error!(
                    kind = job.kind,
                    error = %e,
                    "Failed to enqueue item"
                ),
            }
        }

        info!(
            kind = job.kind,
            created,
            duplicates,
            "Enqueued scheduled items"
        );
        created
    }
}
