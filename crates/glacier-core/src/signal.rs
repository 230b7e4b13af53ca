//! Signal handling for graceful shutdown.

use tracing::{info, warn};

/// Wait for SIGINT, SIGTERM or SIGQUIT.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut sigint), Ok(mut sigterm), Ok(mut sigquit)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    ) else {
        warn!("Failed to install unix signal handlers, falling back to ctrl-c");
        ctrl_c().await;
        return;
    };

    tokio::select! {
        _ = sigint.recv() => info!(message = "Signal received.", signal = "SIGINT"),
        _ = sigterm.recv() => info!(message = "Signal received.", signal = "SIGTERM"),
        _ = sigquit.recv() => info!(message = "Signal received.", signal = "SIGQUIT"),
    }
}

/// Wait for ctrl-c.
#[cfg(not(unix))]
pub async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(message = "Signal received.", signal = "ctrl-c"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for ctrl-c, waiting forever");
            std::future::pending::<()>().await;
        }
    }
}
