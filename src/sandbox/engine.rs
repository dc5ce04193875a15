use std::sync::Arc;

use tokio::time::Instant;

use crate::language::{self, Language, UnsupportedLanguage};

use super::{
    ContainerRuntime, ContainerSpec, ExecutionConstraint, ExecutionOutcome, OOM_KILLED_EXIT_CODE,
    SandboxError,
};

/// Runs submissions in throwaway containers
///
/// Every container created by [`ExecutionEngine::run`] is removed before the
/// call returns, and also when the returned future is dropped half way.
#[derive(Clone)]
pub struct ExecutionEngine {
    runtime: Arc<dyn ContainerRuntime>,
}

/// How the supervised part of a run ended, before logs are attached
enum Termination {
    Exited(i64),
    TimedOut,
    Failed(SandboxError),
}

impl ExecutionEngine {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Pulls the images of `languages` ahead of the first submission
    pub async fn prepare(&self, languages: &[Language]) -> anyhow::Result<()> {
        for &language in languages {
            let image = language::image_for(language)?;
            self.runtime.pull(image).await?;
        }
        Ok(())
    }

    /// Runs `code` under `constraint` and classifies how it terminated
    ///
    /// An unsupported language is reported as an error before any container
    /// exists; every infrastructure failure after that point is folded into
    /// [`ExecutionOutcome::Failed`].
    pub async fn run(
        &self,
        language: Language,
        code: &str,
        constraint: &ExecutionConstraint,
    ) -> Result<ExecutionOutcome, UnsupportedLanguage> {
        let image = language::image_for(language)?;
        let command = language::command_for(language, code)?;

        let spec = ContainerSpec {
            image: image.to_string(),
            argv: command.argv,
            env: command.env,
            memory_limit: constraint.memory_limit(),
        };

        Ok(self.execute(spec, constraint).await)
    }

    async fn execute(&self, spec: ContainerSpec, constraint: &ExecutionConstraint) -> ExecutionOutcome {
        if let Err(error) = self.runtime.pull(&spec.image).await {
            return ExecutionOutcome::Failed { error };
        }

        let container = match self.runtime.create(&spec).await {
            Ok(id) => Container::new(Arc::clone(&self.runtime), id),
            Err(error) => return ExecutionOutcome::Failed { error },
        };
        log::debug!("Container {} created from {}", container.id(), spec.image);

        let termination = self.supervise(container.id(), constraint).await;

        // Best effort: a container that never ran simply has no output
        let output = match self.runtime.logs(container.id()).await {
            Ok(output) => output,
            Err(e) => {
                log::warn!("{e}");
                Vec::new()
            }
        };

        container.reap().await;

        match termination {
            Termination::TimedOut => ExecutionOutcome::TimeExceeded,
            Termination::Exited(OOM_KILLED_EXIT_CODE) => ExecutionOutcome::MemoryExceeded,
            Termination::Exited(exit_code) => ExecutionOutcome::Completed { output, exit_code },
            Termination::Failed(error) => ExecutionOutcome::Failed { error },
        }
    }

    /// Starts the container and waits for it under the time limit
    ///
    /// The deadline is fixed right before the start request is sent, so time
    /// spent creating the container is not charged to the submission.
    async fn supervise(&self, id: &str, constraint: &ExecutionConstraint) -> Termination {
        let deadline = Instant::now() + constraint.time_limit();

        let run = async {
            self.runtime.start(id).await?;
            self.runtime.wait(id).await
        };

        match tokio::time::timeout_at(deadline, run).await {
            Ok(Ok(status)) => Termination::Exited(status),
            Ok(Err(error)) => Termination::Failed(error),
            Err(_) => {
                log::debug!("Container {id} exceeded {:?}", constraint.time_limit());
                Termination::TimedOut
            }
        }
    }
}

/// Owned handle to a created container
///
/// Removal happens in [`Container::reap`]; if the handle is dropped without
/// being reaped, removal is handed to the runtime in the background.
struct Container {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    reaped: bool,
}

impl Container {
    fn new(runtime: Arc<dyn ContainerRuntime>, id: String) -> Self {
        Self {
            runtime,
            id,
            reaped: false,
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn reap(mut self) {
        self.reaped = true;
        match self.runtime.remove(&self.id).await {
            Ok(()) => log::debug!("Container {} removed", self.id),
            Err(e) => log::error!("{e}"),
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }

        let runtime = Arc::clone(&self.runtime);
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!("Run abandoned, removing container {id} in the background");
                handle.spawn(async move {
                    if let Err(e) = runtime.remove(&id).await {
                        log::error!("{e}");
                    }
                });
            }
            Err(_) => log::error!("Container {id} leaked: no runtime left to remove it"),
        }
    }
}
