use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use evaluator::config::CliArgs;
use evaluator::evaluation::EvaluationService;
use evaluator::language::Language;
use evaluator::lifecycle::{ShutdownReason, run_until_shutdown, termination_signal};
use evaluator::pool::WorkerPool;
use evaluator::queue::AmqpBroker;
use evaluator::sandbox::{DockerRuntime, ExecutionEngine};
use evaluator::worker::WorkerContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().context("Failed to load configuration")?;

    let limits = config.evaluation.limit_policy()?;
    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
    let engine = ExecutionEngine::new(Arc::new(runtime));
    if cli.prepull {
        engine.prepare(&Language::SUPPORTED).await?;
    }
    let evaluator = Arc::new(EvaluationService::new(engine, limits));

    let broker = AmqpBroker::connect(
        &config.broker.url,
        config.broker.queue_name.clone(),
        config.broker.queue_type,
        config.broker.dead_letter_queue.clone(),
    )
    .await
    .context("Failed to connect to the message broker")?;

    // ======= PREPARATION END, EXECUTION START =======

    let ctx = WorkerContext {
        broker: Arc::new(broker),
        evaluator,
        delivery: config.broker.delivery_policy(),
        restart: config.pool.restart_policy(),
    };
    let pool = WorkerPool::start(config.pool.workers, ctx);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    match run_until_shutdown(pool, termination_signal()).await {
        ShutdownReason::Signal => {
            log::info!("Shutdown complete");
            Ok(())
        }
        ShutdownReason::WorkersExited => {
            anyhow::bail!("Every worker exited before shutdown was requested")
        }
    }
}
