//! Worker loop that claims units and dispatches them to handlers.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::{ErasedHandler, Handler, HandlerError, HandlerWrapper, UnitContext};
use crate::config::WorkerSettings;
use crate::queue::{
    Claim, ClaimedUnit, CompleteOutcome, Completion, FailOutcome, Failure, StoreError, UnitId,
    WorkStore,
};
use crate::retry::RetryPolicy;
use crate::scheduler::PeriodicScheduler;

/// Error type for the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("no handlers registered")]
    NoHandlers,

    #[error("handler timeout ({timeout:?}) must be shorter than the lease ({lease:?})")]
    TimeoutNotBelowLease { timeout: Duration, lease: Duration },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

type Registry = HashMap<&'static str, Arc<dyn ErasedHandler>>;
type InFlight = Arc<Mutex<HashMap<UnitId, Claim>>>;

/// A worker that executes units from a store.
pub struct Worker<S: WorkStore> {
    store: Arc<S>,
    handlers: Registry,
    worker_id: String,
    lease: Duration,
    handler_timeout: Duration,
    poll_interval: Duration,
    batch_size: usize,
    concurrency: usize,
    shutdown_grace: Duration,
    retry: RetryPolicy,
}

impl<S: WorkStore + 'static> Worker<S> {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Kinds this worker claims.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Run the claim loop until `shutdown` is cancelled.
    ///
    /// Expired leases are reclaimed once at startup. On shutdown the worker
    /// stops claiming, waits up to the grace period for in-flight units,
    /// then aborts the rest and releases their claims.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let kinds = self.kinds();
        let reclaimed = self.store.reclaim_expired().await?;
        info!(
            worker = %self.worker_id,
            kinds = ?kinds,
            concurrency = self.concurrency,
            requeued = reclaimed.requeued,
            failed = reclaimed.failed,
            "worker started"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
        let abort = CancellationToken::new();
        let mut tasks = JoinSet::new();

        while !shutdown.is_cancelled() {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "unit task panicked");
                }
            }

            let free = semaphore.available_permits().min(self.batch_size);
            let mut full_batch = false;
            if free > 0 {
                match self
                    .store
                    .claim(&self.worker_id, &kinds, free, self.lease)
                    .await
                {
                    Ok(units) => {
                        full_batch = units.len() == free;
                        for unit in units {
                            self.spawn_unit(&mut tasks, &semaphore, &in_flight, &abort, unit)
                                .await;
                        }
                    }
                    Err(e) => warn!(error = %e, "claim failed"),
                }
            }

            if full_batch && semaphore.available_permits() > 0 {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.drain(tasks, in_flight, abort).await;
        info!(worker = %self.worker_id, "worker stopped");
        Ok(())
    }

    /// Run the claim loop with `scheduler` beside it. The scheduler stops as
    /// soon as the worker returns, including when the worker fails at startup.
    pub async fn run_with_scheduler<T: WorkStore + 'static>(
        &self,
        scheduler: &PeriodicScheduler<T>,
        shutdown: CancellationToken,
    ) -> Result<(), WorkerError> {
        let scheduler_shutdown = shutdown.child_token();
        let worker = async {
            let result = self.run(shutdown).await;
            if let Err(e) = &result {
                error!(error = %e, "worker stopped with an error, stopping scheduler");
            }
            scheduler_shutdown.cancel();
            result
        };
        let (result, ()) = tokio::join!(worker, scheduler.run(scheduler_shutdown.clone()));
        result
    }

    /// Claim one batch and process it to the end. Returns the number of
    /// units processed.
    pub async fn run_once(&self) -> Result<usize, WorkerError> {
        let kinds = self.kinds();
        let limit = self.batch_size.min(self.concurrency);
        let units = self
            .store
            .claim(&self.worker_id, &kinds, limit, self.lease)
            .await?;
        let count = units.len();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
        let abort = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for unit in units {
            self.spawn_unit(&mut tasks, &semaphore, &in_flight, &abort, unit)
                .await;
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "unit task panicked");
            }
        }
        Ok(count)
    }

    async fn spawn_unit(
        &self,
        tasks: &mut JoinSet<()>,
        semaphore: &Arc<Semaphore>,
        in_flight: &InFlight,
        abort: &CancellationToken,
        unit: ClaimedUnit,
    ) {
        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            // Claimed more than there are free slots; hand it back.
            if let Err(e) = self.store.release(&unit.claim).await {
                warn!(unit = %unit.id(), error = %e, "could not release surplus claim");
            }
            return;
        };

        in_flight.lock().await.insert(unit.id(), unit.claim.clone());

        let job = UnitJob {
            store: self.store.clone(),
            handler: self.handlers.get(unit.kind.as_str()).cloned(),
            timeout: self.handler_timeout,
            retry: self.retry.clone(),
            in_flight: in_flight.clone(),
            cancel: abort.child_token(),
        };
        tasks.spawn(job.run(unit, permit));
    }

    async fn drain(&self, mut tasks: JoinSet<()>, in_flight: InFlight, abort: CancellationToken) {
        if !tasks.is_empty() {
            info!(
                in_flight = tasks.len(),
                grace = ?self.shutdown_grace,
                "waiting for in-flight units"
            );
            let finished = tokio::time::timeout(self.shutdown_grace, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;

            if finished.is_err() {
                warn!(
                    remaining = tasks.len(),
                    "shutdown grace elapsed, aborting in-flight units"
                );
                abort.cancel();
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
        }

        let leftover: Vec<Claim> = in_flight.lock().await.drain().map(|(_, c)| c).collect();
        for claim in leftover {
            match self.store.release(&claim).await {
                Ok(true) => info!(unit = %claim.unit_id, "claim released"),
                Ok(false) => debug!(unit = %claim.unit_id, "claim already settled"),
                Err(e) => warn!(
                    unit = %claim.unit_id,
                    error = %e,
                    "release failed, unit returns after lease expiry"
                ),
            }
        }
    }
}

/// Everything a spawned unit task needs.
struct UnitJob<S: WorkStore> {
    store: Arc<S>,
    handler: Option<Arc<dyn ErasedHandler>>,
    timeout: Duration,
    retry: RetryPolicy,
    in_flight: InFlight,
    cancel: CancellationToken,
}

impl<S: WorkStore + 'static> UnitJob<S> {
    async fn run(self, unit: ClaimedUnit, permit: OwnedSemaphorePermit) {
        let claim = unit.claim.clone();
        let ctx = UnitContext {
            unit_id: unit.id(),
            kind: unit.kind.clone(),
            attempt: claim.attempt,
            max_attempts: unit.max_attempts,
            worker_id: claim.worker.clone(),
            cancel: self.cancel.clone(),
        };

        let outcome = match &self.handler {
            None => Err(HandlerError::permanent(anyhow::anyhow!(
                "no handler registered for kind {}",
                unit.kind
            ))),
            Some(handler) => self.execute(handler.clone(), unit.payload, &ctx).await,
        };

        match outcome {
            Ok(completion) => match self.store.complete(&claim, completion).await {
                Ok(CompleteOutcome::Applied { follow_ups }) => info!(
                    unit = %ctx.unit_id,
                    kind = %ctx.kind,
                    attempt = ctx.attempt,
                    follow_ups = follow_ups.len(),
                    "unit completed"
                ),
                Ok(CompleteOutcome::AlreadyCompleted) => {
                    debug!(unit = %ctx.unit_id, "unit was already completed")
                }
                Ok(CompleteOutcome::ClaimLost) => warn!(
                    unit = %ctx.unit_id,
                    kind = %ctx.kind,
                    "claim lost before completion, result discarded"
                ),
                Err(e) => error!(
                    unit = %ctx.unit_id,
                    error = %e,
                    "failed to record completion, unit returns after lease expiry"
                ),
            },
            Err(err) => {
                let failure = if err.is_retryable() {
                    Failure::retryable(err.message(), self.retry.delay_for_attempt(ctx.attempt))
                } else {
                    Failure::permanent(err.message())
                };
                match self.store.fail(&claim, failure).await {
                    Ok(FailOutcome::Retrying { available_at }) => warn!(
                        unit = %ctx.unit_id,
                        kind = %ctx.kind,
                        attempt = ctx.attempt,
                        max_attempts = ctx.max_attempts,
                        retry_at = %available_at,
                        error = %err,
                        "unit failed, will retry"
                    ),
                    Ok(FailOutcome::Terminal) => error!(
                        unit = %ctx.unit_id,
                        kind = %ctx.kind,
                        attempt = ctx.attempt,
                        error = %err,
                        "unit failed terminally"
                    ),
                    Ok(FailOutcome::ClaimLost) => warn!(
                        unit = %ctx.unit_id,
                        "claim lost before failure was recorded"
                    ),
                    Err(e) => error!(
                        unit = %ctx.unit_id,
                        error = %e,
                        "failed to record failure, unit returns after lease expiry"
                    ),
                }
            }
        }

        self.in_flight.lock().await.remove(&claim.unit_id);
        drop(permit);
    }

    /// Run the handler in its own task. A panic becomes a retryable failure.
    async fn execute(
        &self,
        handler: Arc<dyn ErasedHandler>,
        payload: serde_json::Value,
        ctx: &UnitContext,
    ) -> Result<Completion, HandlerError> {
        let task_ctx = ctx.clone();
        // Dropping the set aborts the handler, on timeout or when this task is aborted.
        let mut task = JoinSet::new();
        task.spawn(async move { handler.handle_erased(payload, &task_ctx).await });

        match tokio::time::timeout(self.timeout, task.join_next()).await {
            Ok(Some(Ok(result))) => result,
            Ok(Some(Err(e))) if e.is_panic() => Err(HandlerError::retryable(anyhow::anyhow!(
                "handler panicked: {}",
                panic_message(e.into_panic())
            ))),
            Ok(_) => Err(HandlerError::retryable(anyhow::anyhow!(
                "handler task was cancelled"
            ))),
            Err(_) => Err(HandlerError::retryable(anyhow::anyhow!(
                "handler timed out after {}",
                humantime::format_duration(self.timeout)
            ))),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Builder for constructing a Worker.
pub struct WorkerBuilder<S: WorkStore> {
    store: S,
    handlers: Registry,
    worker_id: String,
    lease: Duration,
    handler_timeout: Duration,
    poll_interval: Duration,
    batch_size: usize,
    concurrency: usize,
    shutdown_grace: Duration,
    retry: RetryPolicy,
}

impl<S: WorkStore + 'static> WorkerBuilder<S> {
    /// Create a new builder with the given store and default settings.
    pub fn new(store: S) -> Self {
        let defaults = WorkerSettings::default();
        Self {
            store,
            handlers: HashMap::new(),
            worker_id: defaults.worker_id,
            lease: defaults.lease,
            handler_timeout: defaults.handler_timeout,
            poll_interval: defaults.poll_interval,
            batch_size: defaults.batch_size,
            concurrency: defaults.concurrency,
            shutdown_grace: defaults.shutdown_grace,
            retry: RetryPolicy::exponential(defaults.retry_base, defaults.retry_max),
        }
    }

    /// Apply every loop parameter from settings.
    pub fn settings(mut self, settings: &WorkerSettings) -> Self {
        self.worker_id = settings.worker_id.clone();
        self.lease = settings.lease;
        self.handler_timeout = settings.handler_timeout;
        self.poll_interval = settings.poll_interval;
        self.batch_size = settings.batch_size;
        self.concurrency = settings.concurrency;
        self.shutdown_grace = settings.shutdown_grace;
        self.retry = RetryPolicy::from_settings(settings);
        self
    }

    /// Register a handler with the worker.
    pub fn handler(self, handler: impl Handler + 'static) -> Self {
        self.erased_handler(Arc::new(HandlerWrapper(handler)))
    }

    /// Register an already type-erased handler.
    pub fn erased_handler(mut self, handler: Arc<dyn ErasedHandler>) -> Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    pub fn worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set the poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    /// Set the maximum concurrent units.
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Build the worker.
    pub fn build(self) -> Result<Worker<S>, WorkerError> {
        if self.handlers.is_empty() {
            return Err(WorkerError::NoHandlers);
        }
        if self.handler_timeout >= self.lease {
            return Err(WorkerError::TimeoutNotBelowLease {
                timeout: self.handler_timeout,
                lease: self.lease,
            });
        }
        Ok(Worker {
            store: Arc::new(self.store),
            handlers: self.handlers,
            worker_id: self.worker_id,
            lease: self.lease,
            handler_timeout: self.handler_timeout,
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            shutdown_grace: self.shutdown_grace,
            retry: self.retry,
        })
    }
}
