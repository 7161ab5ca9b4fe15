//! Shutdown signal handling.

use std::io;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Wait for SIGINT, SIGTERM or SIGQUIT.
#[cfg(unix)]
pub async fn shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "signal received"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "signal received"),
        _ = sigquit.recv() => info!(signal = "SIGQUIT", "signal received"),
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "signal received");
    Ok(())
}

/// Cancels `shutdown` once a signal arrives (or signal setup fails).
pub fn spawn_signal_handler(shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = shutdown_signal().await {
            tracing::error!(error = %err, "installing signal handlers failed, shutting down");
        }
        shutdown.cancel();
    })
}
