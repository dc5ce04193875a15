use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio_util::sync::CancellationToken;

use crate::evaluation::EvaluationService;
use crate::queue::{Broker, Consumer, Delivery, Disposition, QueueError};
use crate::submission::Submission;

/// How deliveries that cannot be acknowledged are disposed of
#[derive(Debug, Clone, Default)]
pub struct DeliveryPolicy {
    /// Park poison messages on the dead-letter queue instead of dropping them
    pub dead_letter: bool,
    /// Attempts after which a transient failure is treated as poison
    pub max_redeliveries: Option<u32>,
}

impl DeliveryPolicy {
    pub fn poison(&self) -> Disposition {
        if self.dead_letter {
            Disposition::DeadLetter
        } else {
            Disposition::Reject
        }
    }

    /// Disposition for a retryable failure on a delivery seen `attempt` times before
    pub fn transient_failure(&self, attempt: u32) -> Disposition {
        match self.max_redeliveries {
            Some(max) if attempt >= max => self.poison(),
            _ => Disposition::Requeue,
        }
    }
}

/// Bounded exponential backoff for re-opening a consumer
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RestartPolicy {
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Everything a worker loop shares with its siblings
#[derive(Clone)]
pub struct WorkerContext {
    pub broker: Arc<dyn Broker>,
    pub evaluator: Arc<EvaluationService>,
    pub delivery: DeliveryPolicy,
    pub restart: RestartPolicy,
}

/// Why a consumer session stopped
enum SessionEnd {
    Shutdown,
    Failed(anyhow::Error),
}

/// Consumes the work queue until `token` is cancelled
///
/// The consumer is re-opened with backoff whenever its channel breaks. The
/// loop only gives up, with an error, after `max_restarts` consecutive
/// sessions that failed without settling a single delivery.
pub async fn worker(id: usize, ctx: WorkerContext, token: CancellationToken) -> anyhow::Result<()> {
    let mut failures = 0u32;

    loop {
        let (end, settled) = run_session(id, &ctx, &token).await;

        let error = match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Failed(error) => error,
        };
        if token.is_cancelled() {
            break;
        }

        failures = if settled > 0 { 1 } else { failures + 1 };
        if failures > ctx.restart.max_restarts {
            bail!("Worker {id} giving up after {failures} failed attempts: {error:#}");
        }

        let delay = ctx.restart.backoff(failures);
        log::warn!("Worker {id}: {error:#}; reconnecting in {delay:?}");

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

/// Opens a consumer and dispatches deliveries until shutdown or failure
///
/// Also returns how many deliveries were settled during the session.
async fn run_session(id: usize, ctx: &WorkerContext, token: &CancellationToken) -> (SessionEnd, u64) {
    let mut consumer = match ctx.broker.open_consumer(id).await {
        Ok(consumer) => consumer,
        Err(e) => {
            return (
                SessionEnd::Failed(anyhow!(e).context("failed to open consumer")),
                0,
            );
        }
    };
    log::info!("Worker {id} started and waiting for submissions...");

    let mut settled = 0;
    let end = loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break SessionEnd::Shutdown;
            }
            next = consumer.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => break SessionEnd::Failed(e.into()),
            None => break SessionEnd::Failed(QueueError::Closed.into()),
        };

        // Shutdown is not observed past this point: the delivery in hand is
        // always evaluated and settled before the loop looks at the token again
        if let Err(e) = dispatch(id, ctx, consumer.as_mut(), delivery).await {
            break SessionEnd::Failed(e);
        }
        settled += 1;
    };

    consumer.close().await;
    (end, settled)
}

async fn dispatch(
    id: usize,
    ctx: &WorkerContext,
    consumer: &mut dyn Consumer,
    delivery: Delivery,
) -> anyhow::Result<()> {
    let tag = delivery.tag();
    let disposition = process(id, ctx, &delivery).await;

    consumer.settle(delivery, disposition).await?;
    log::debug!("Worker {id} settled delivery {tag} with {disposition:?}");
    Ok(())
}

/// Decodes and evaluates one delivery and picks its disposition
async fn process(id: usize, ctx: &WorkerContext, delivery: &Delivery) -> Disposition {
    let submission = match Submission::decode(delivery.body()) {
        Ok(submission) => submission,
        Err(e) => {
            log::error!("Worker {id} discarding delivery {}: {e}", delivery.tag());
            return ctx.delivery.poison();
        }
    };
    let submission_id = submission.id.clone();
    log::info!(
        "Worker {id} got submission {submission_id} ({}) from queue",
        submission.language
    );

    // Evaluate on its own task so a panic costs this delivery, not the loop
    let evaluator = Arc::clone(&ctx.evaluator);
    let handle = tokio::spawn(async move { evaluator.evaluate(&submission).await });

    match handle.await {
        Ok(Ok(result)) => {
            log::info!(
                "Worker {id} finished submission {submission_id}: {}",
                result.outcome.verdict()
            );
            Disposition::Ack
        }
        Ok(Err(e)) if !e.is_retryable() => {
            log::error!("Worker {id} dropping submission {submission_id}: {e}");
            ctx.delivery.poison()
        }
        Ok(Err(e)) => {
            let disposition = ctx.delivery.transient_failure(delivery.attempt());
            log::error!(
                "Worker {id} failed submission {submission_id} (attempt {}): {e}; {disposition:?}",
                delivery.attempt() + 1
            );
            disposition
        }
        Err(e) => {
            log::error!("Evaluation task for {submission_id} failed on worker {id}: {e:?}");
            ctx.delivery.transient_failure(delivery.attempt())
        }
    }
}
