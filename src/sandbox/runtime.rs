use super::SandboxError;

/// Everything needed to create one isolated execution context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    /// Memory ceiling in bytes
    pub memory_limit: u64,
}

/// Trait for the container runtime that hosts sandboxed runs
///
/// Implementations may be shared by every worker at once, so none of these
/// operations may assume exclusive access to the runtime.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Makes `image` available locally; a no-op when it already is
    async fn pull(&self, image: &str) -> Result<(), SandboxError>;

    /// Creates a stopped container and returns its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String, SandboxError>;

    async fn start(&self, id: &str) -> Result<(), SandboxError>;

    /// Blocks until the container stops and returns its exit status
    async fn wait(&self, id: &str) -> Result<i64, SandboxError>;

    /// Combined stdout and stderr produced so far
    async fn logs(&self, id: &str) -> Result<Vec<u8>, SandboxError>;

    /// Kills and deletes the container; removing an unknown id succeeds
    async fn remove(&self, id: &str) -> Result<(), SandboxError>;
}
