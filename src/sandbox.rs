mod docker;
mod engine;
mod runtime;

pub use docker::DockerRuntime;
pub use engine::ExecutionEngine;
pub use runtime::{ContainerRuntime, ContainerSpec};

#[cfg(test)]
pub use runtime::MockContainerRuntime;

use std::time::Duration;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Exit status reported for a container killed by `SIGKILL`, which is how the
/// kernel OOM killer terminates a cgroup that outgrew its memory ceiling
pub const OOM_KILLED_EXIT_CODE: i64 = 128 + libc::SIGKILL as i64;

/// Smallest memory ceiling the container runtime accepts
pub const MIN_MEMORY_LIMIT: u64 = 6 * 1024 * 1024;

/// Resource bounds applied to one sandboxed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionConstraint {
    time_limit: Duration,
    memory_limit: u64,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConstraintError {
    #[error("time limit must be positive")]
    ZeroTimeLimit,
    #[error("memory limit of {0} bytes is below the {min} byte minimum", min = MIN_MEMORY_LIMIT)]
    MemoryTooSmall(u64),
    #[error("memory limit of {0} bytes does not fit the runtime's signed 64-bit field")]
    MemoryTooLarge(u64),
}

impl ExecutionConstraint {
    pub fn new(time_limit: Duration, memory_limit: u64) -> Result<Self, ConstraintError> {
        if time_limit.is_zero() {
            return Err(ConstraintError::ZeroTimeLimit);
        }
        if memory_limit < MIN_MEMORY_LIMIT {
            return Err(ConstraintError::MemoryTooSmall(memory_limit));
        }
        if i64::try_from(memory_limit).is_err() {
            return Err(ConstraintError::MemoryTooLarge(memory_limit));
        }

        Ok(Self {
            time_limit,
            memory_limit,
        })
    }

    pub fn time_limit(&self) -> Duration {
        self.time_limit
    }

    /// Memory ceiling in bytes
    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }
}

/// Terminal classification of one sandboxed run
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The workload exited on its own; `output` interleaves stdout and stderr
    Completed { output: Vec<u8>, exit_code: i64 },
    TimeExceeded,
    MemoryExceeded,
    Failed { error: SandboxError },
}

impl ExecutionOutcome {
    pub fn verdict(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed { exit_code: 0, .. } => "Completed",
            ExecutionOutcome::Completed { .. } => "Runtime Error",
            ExecutionOutcome::TimeExceeded => "Time Limit Exceeded",
            ExecutionOutcome::MemoryExceeded => "Memory Limit Exceeded",
            ExecutionOutcome::Failed { .. } => "System Error",
        }
    }
}

/// Infrastructure failures reported by the isolation substrate
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("failed to pull image {image}: {source}")]
    ImagePull {
        image: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to create container: {0}")]
    Creation(#[source] BoxError),
    #[error("failed to start container {id}: {source}")]
    Start {
        id: String,
        #[source]
        source: BoxError,
    },
    #[error("failed waiting for container {id}: {source}")]
    Wait {
        id: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to read logs of container {id}: {source}")]
    Logs {
        id: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to remove container {id}: {source}")]
    Removal {
        id: String,
        #[source]
        source: BoxError,
    },
}
