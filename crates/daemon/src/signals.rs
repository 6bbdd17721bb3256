//! Shutdown signal for the web server.
//!
//! Resolves on SIGTERM (Unix) or Ctrl+C. Axum then stops accepting
//! connections and drains in-flight requests, so a merge that already holds
//! its branch lock runs to commit or rollback before the process exits.

use tracing::info;

pub async fn shutdown_signal() {
    let interrupt = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    info!(signal = received, "shutdown requested, draining in-flight requests");
}
