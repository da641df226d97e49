use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Wait for Ctrl+C or SIGTERM.
///
/// # Errors
/// A signal handler that cannot be installed.
pub async fn wait_for_shutdown() -> Result<()> {
    tokio::select! {
        result = signal::ctrl_c() => {
            result.inspect_err(|e| tracing::error!(%e, "Ctrl+C handler failed"))?;
            tracing::info!("received Ctrl+C");
        }
        result = wait_sigterm() => result?,
    }
    Ok(())
}

/// Cancel `root` once a shutdown signal arrives.
pub fn cancel_on_signal(root: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            tracing::warn!(error = %e, "signal waiter failed, falling back to Ctrl+C only");
            // A second failure leaves cancellation to the caller.
            if signal::ctrl_c().await.is_err() {
                return;
            }
        }
        tracing::info!("shutdown signal received, draining connections");
        root.cancel();
    });
}

#[cfg(unix)]
async fn wait_sigterm() -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .inspect_err(|e| tracing::error!(%e, "failed to install SIGTERM handler"))?;
    sigterm.recv().await;
    tracing::info!("received SIGTERM");
    Ok(())
}

#[cfg(not(unix))]
async fn wait_sigterm() -> Result<()> {
    std::future::pending::<Result<()>>().await
}
