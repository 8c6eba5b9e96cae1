//! `jobgate run-all`: the three roles as child processes of this binary.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::Context;
use jobgate::Settings;
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::signal::SUPERVISED_ENV;

/// How long a child gets to stop after its stdin is closed.
const STOP_GRACE: Duration = Duration::from_secs(30);

pub async fn run_all(settings: &Settings, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut roles = vec!["api", "worker"];
    if settings.bot.token.is_some() {
        roles.push("bot");
    } else {
        tracing::warn!("BOT_TOKEN not set, skipping bot");
    }

    let exe = std::env::current_exe().context("cannot locate the jobgate binary")?;
    let stop = CancellationToken::new();
    let mut children = JoinSet::new();

    for role in roles {
        let child = Command::new(&exe)
            .arg(role)
            .env(SUPERVISED_ENV, "1")
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {role}"))?;
        tracing::info!(role, pid = child.id(), "started");
        children.spawn(supervise(role, child, stop.clone()));
    }

    let mut failed = Vec::new();
    tokio::select! {
        _ = shutdown.cancelled() => {}
        Some(joined) = children.join_next() => {
            let (role, status) = joined?;
            if !status.as_ref().is_ok_and(ExitStatus::success) {
                failed.push(role);
            }
            tracing::warn!(role, ?status, "child exited, stopping the rest");
        }
    }

    stop.cancel();
    while let Some(joined) = children.join_next().await {
        let (role, status) = joined?;
        tracing::info!(role, ?status, "stopped");
        if !status.as_ref().is_ok_and(ExitStatus::success) {
            failed.push(role);
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} exited with an error", failed.join(", "))
    }
}

async fn supervise(
    role: &'static str,
    mut child: Child,
    stop: CancellationToken,
) -> (&'static str, std::io::Result<ExitStatus>) {
    tokio::select! {
        status = child.wait() => return (role, status),
        _ = stop.cancelled() => {}
    }

    // Closing stdin asks the child to shut down gracefully.
    drop(child.stdin.take());
    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(status) => (role, status),
        Err(_) => {
            tracing::warn!(role, "did not stop in time, killing");
            if let Err(e) = child.start_kill() {
                tracing::error!(role, error = %e, "kill failed");
            }
            (role, child.wait().await)
        }
    }
}
