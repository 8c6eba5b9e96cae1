//! Shutdown signals.

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Set on children started by `run-all`. They also stop when their stdin closes.
pub const SUPERVISED_ENV: &str = "JOBGATE_SUPERVISED";

/// A token cancelled on SIGINT or SIGTERM, or when a supervising parent goes away.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();

    let on_signal = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        on_signal.cancel();
    });

    if std::env::var_os(SUPERVISED_ENV).is_some() {
        let on_eof = token.clone();
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = [0u8; 64];
            // Anything but EOF is ignored.
            while matches!(stdin.read(&mut buf).await, Ok(n) if n > 0) {}
            tracing::debug!("supervisor closed stdin");
            on_eof.cancel();
        });
    }

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
