//! Interrupt handling for the worker pool.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancel `token` when the process receives SIGINT or SIGTERM.
///
/// Workers observe the token at poll boundaries, so an interrupt stops
/// new claims and lets in-flight attempts finish (or hit their
/// timeout).
pub(crate) fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, draining workers");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(error), _) | (_, Err(error)) => {
                error!(%error, "failed to install signal handlers");
                std::future::pending::<()>().await;
                return;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
