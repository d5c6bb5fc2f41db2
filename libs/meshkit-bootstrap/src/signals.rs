//! Process shutdown signals: Ctrl+C everywhere, SIGTERM on unix.

use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Signal that ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    CtrlC,
    #[cfg(unix)]
    Sigterm,
}

/// Wait for termination signals (Ctrl+C, SIGTERM).
///
/// # Errors
/// Returns an error if signal handling fails.
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    let signal = tokio::select! {
        result = wait_ctrl_c() => result?,
        result = wait_sigterm() => result?,
    };

    tracing::info!(?signal, "shutdown signal received, initiating graceful shutdown");
    Ok(signal)
}

/// Root token cancelled on the first termination signal.
///
/// If the signal handlers cannot be installed the watcher falls back to
/// Ctrl+C only.
#[must_use]
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            tracing::warn!(error = %e, "signal waiter failed, falling back to ctrl_c()");
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!(error = %e, "ctrl_c() handler failed, shutting down");
            }
        }
        trigger.cancel();
    });
    token
}

async fn wait_ctrl_c() -> Result<ShutdownSignal> {
    signal::ctrl_c().await.map_err(|e| {
        tracing::error!(%e, "Error handling Ctrl+C signal");
        e
    })?;
    Ok(ShutdownSignal::CtrlC)
}

#[cfg(unix)]
async fn wait_sigterm() -> Result<ShutdownSignal> {
    let mut signal_handler =
        signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
            tracing::error!(%e, "Failed to install SIGTERM handler");
            e
        })?;
    signal_handler.recv().await;
    Ok(ShutdownSignal::Sigterm)
}

#[cfg(not(unix))]
async fn wait_sigterm() -> Result<ShutdownSignal> {
    std::future::pending::<Result<ShutdownSignal>>().await
}
