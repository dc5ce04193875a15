use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::worker::{WorkerContext, worker};

/// A fixed set of independent consumer loops on one work queue
pub struct WorkerPool {
    workers: JoinSet<anyhow::Result<()>>,
    token: CancellationToken,
}

impl WorkerPool {
    /// Spawns `count` workers, numbered from 1
    pub fn start(count: usize, ctx: WorkerContext) -> Self {
        log::info!("Starting {count} workers");

        let token = CancellationToken::new();
        let mut workers = JoinSet::new();
        for id in 1..=count {
            workers.spawn(worker(id, ctx.clone(), token.clone()));
        }

        Self { workers, token }
    }

    /// Number of workers that have not exited yet
    pub fn active(&self) -> usize {
        self.workers.len()
    }

    /// Resolves once every worker has exited on its own
    ///
    /// Cancel-safe: dropping this future loses no exit report.
    pub async fn wait_all_exited(&mut self) {
        while let Some(res) = self.workers.join_next().await {
            log_exit(res);
        }
    }

    /// Signals every worker to stop and waits until all of them have exited
    ///
    /// Workers finish and settle the delivery they hold before exiting.
    pub async fn stop(mut self) {
        self.token.cancel();
        log::info!(
            "Shutdown signal sent to {} workers, waiting for them to finish...",
            self.workers.len()
        );

        self.wait_all_exited().await;
        log::info!("All workers stopped");
    }
}

fn log_exit(res: Result<anyhow::Result<()>, JoinError>) {
    match res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("{e:#}"),
        Err(e) if e.is_panic() => log::error!("Worker handle panicked: {e:?}"),
        Err(e) => log::error!("Worker handle finished with error: {e:?}"),
    }
}
