use super::job::{PeriodicScheduler, QueryFn, RegisteredJob};
use crate::queue::WorkStore;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Builder for configuring a PeriodicScheduler.
pub struct SchedulerBuilder<S: WorkStore> {
    store: S,
    jobs: Vec<RegisteredJob>,
}

impl<S: WorkStore + 'static> SchedulerBuilder<S> {
    /// Create a new scheduler builder with the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            jobs: Vec::new(),
        }
    }

    /// Add a job that queries for items and enqueues them as units of `kind`.
    ///
    /// The query function is called at each interval and should return
    /// items to enqueue. Each item is serialized to JSON and becomes the
    /// payload of one unit.
    pub fn job<F, Fut, T>(mut self, kind: &'static str, interval: Duration, query_fn: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<T>> + Send + 'static,
        T: Serialize + 'static,
    {
        let query_fn: QueryFn = Arc::new(move || {
            let fut = query_fn();
            Box::pin(async move {
                let items = fut.await;
                items
                    .into_iter()
                    .filter_map(|item| serde_json::to_value(item).ok())
                    .collect()
            })
        });

        self.jobs.push(RegisteredJob {
            kind,
            interval,
            query_fn,
            run_on_start: false,
            dedupe: false,
        });

        self
    }

    /// Set whether the most recently added job should run immediately on start.
    ///
    /// Must be called after `.job()`. Defaults to false.
    pub fn run_on_start(mut self, run: bool) -> Self {
        if let Some(job) = self.jobs.last_mut() {
            job.run_on_start = run;
        }
        self
    }

    /// Skip items that already have an outstanding unit, keyed by the item's
    /// JSON text. Lets several worker processes run the same schedule.
    ///
    /// Must be called after `.job()`. Defaults to false.
    pub fn dedupe(mut self, dedupe: bool) -> Self {
        if let Some(job) = self.jobs.last_mut() {
            job.dedupe = dedupe;
        }
        self
    }

    /// Build the scheduler.
    pub fn build(self) -> PeriodicScheduler<S> {
        PeriodicScheduler::new(self.store, self.jobs)
    }
}
