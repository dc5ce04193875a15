use std::future::Future;

use crate::pool::WorkerPool;

/// What ended the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
    WorkersExited,
}

/// Runs `pool` until `shutdown` resolves or every worker has exited
///
/// Both events take the same path: the pool is stopped and fully drained
/// before this returns.
pub async fn run_until_shutdown<F>(mut pool: WorkerPool, shutdown: F) -> ShutdownReason
where
    F: Future<Output = ()>,
{
    let reason = tokio::select! {
        _ = shutdown => {
            log::info!("Shutdown signal received, shutting down...");
            ShutdownReason::Signal
        }
        _ = pool.wait_all_exited() => {
            log::error!("All workers have exited unexpectedly, shutting down...");
            ShutdownReason::WorkersExited
        }
    };

    pool.stop().await;
    reason
}

/// Resolves on Ctrl-C or, on Unix, `SIGTERM`
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
