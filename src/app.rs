//! Process-level glue: signal handling around a running engine.
//!
//! There is no main application loop; the engine runs its own tasks. What
//! remains at this level is waiting for the operator to ask for shutdown.
use tracing::info;

/// Resolves on `ctrl_c` or, on unix, the terminate signal.
pub async fn shutdown_signal() {
    let interrupt = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!("interrupt received"),
        () = terminate => info!("terminate received"),
    }
}
