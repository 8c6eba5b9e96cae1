//! The three runtime processes. Each opens the store through the schema gate.

use std::sync::Arc;
use std::time::Duration;

use jobgate::handlers::{retention, PurgeHandler, PurgeRequest, WebhookHandler};
use jobgate::{gate, Role, SchedulerBuilder, Settings, SqliteWorkStore, WorkerBuilder};
use jobgate_api::ApiState;
use tokio_util::sync::CancellationToken;

/// Upper bound for a single outbound webhook call.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn api(settings: Settings, shutdown: CancellationToken) -> anyhow::Result<()> {
    let pool = gate::open(Role::Api, &settings).await?;
    let state = ApiState::new(SqliteWorkStore::new(pool.clone()));

    jobgate_api::run_server(&settings.api, state, shutdown).await?;
    pool.close().await;
    Ok(())
}

pub async fn bot(settings: Settings, shutdown: CancellationToken) -> anyhow::Result<()> {
    if settings.bot.token.is_none() {
        anyhow::bail!("BOT_TOKEN is not set");
    }
    let pool = gate::open(Role::Bot, &settings).await?;

    jobgate_bot::run_polling(&settings.bot, SqliteWorkStore::new(pool.clone()), shutdown).await?;
    pool.close().await;
    Ok(())
}

pub async fn worker(
    settings: Settings,
    shutdown: CancellationToken,
    once: bool,
) -> anyhow::Result<()> {
    let pool = gate::open(Role::Worker, &settings).await?;
    let store = SqliteWorkStore::new(pool.clone())
        .with_default_max_attempts(settings.worker.max_attempts);

    let webhook_timeout = WEBHOOK_TIMEOUT.min(settings.worker.handler_timeout);
    let worker = WorkerBuilder::new(store.clone())
        .settings(&settings.worker)
        .handler(PurgeHandler::new(Arc::new(store.clone())))
        .handler(WebhookHandler::new(webhook_timeout, settings.http_use_proxy)?)
        .build()?;

    tracing::info!(
        worker_id = %worker.worker_id(),
        kinds = ?worker.kinds(),
        "worker ready"
    );

    if once {
        let processed = worker.run_once().await?;
        println!("processed {processed} unit(s)");
        pool.close().await;
        return Ok(());
    }

    let keep_for = settings.worker.retention;
    let scheduler = SchedulerBuilder::new(store)
        .job(
            retention::KIND,
            settings.worker.retention_interval,
            move || async move { vec![PurgeRequest::older_than(keep_for)] },
        )
        .run_on_start(true)
        .dedupe(true)
        .build();

    let result = worker.run_with_scheduler(&scheduler, shutdown).await;
    pool.close().await;
    result?;
    Ok(())
}
