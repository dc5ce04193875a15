use std::collections::HashMap;

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures_util::stream::StreamExt;

use super::{ContainerRuntime, ContainerSpec, SandboxError};

const RUNTIME_PIDS_LIMIT: i64 = 64;
const MANAGED_LABEL: (&str, &str) = ("managed-by", "evaluator");

/// Container runtime backed by the local Docker daemon
///
/// Containers are created with networking disabled, no swap beyond the memory
/// ceiling and a bounded process count. They are never auto-removed by the
/// daemon: the engine reads their logs first and removes them itself.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using `DOCKER_HOST` or the platform's default socket
    pub fn connect() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()?;
        log::info!("Connected to container runtime");
        Ok(Self { docker })
    }

    fn host_config(spec: &ContainerSpec) -> HostConfig {
        // `ExecutionConstraint` guarantees the ceiling fits an i64
        let memory = i64::try_from(spec.memory_limit).unwrap_or(i64::MAX);

        HostConfig {
            memory: Some(memory),
            memory_swap: Some(memory),
            pids_limit: Some(RUNTIME_PIDS_LIMIT),
            auto_remove: Some(false),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        log::info!("Pulling image {image}...");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            step.map_err(|e| SandboxError::ImagePull {
                image: image.to_string(),
                source: e.into(),
            })?;
        }

        log::info!("Successfully pulled image {image}");
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.argv.clone()),
            env: Some(spec.env.clone()),
            tty: Some(false),
            network_disabled: Some(true),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.0.to_string(),
                MANAGED_LABEL.1.to_string(),
            )])),
            host_config: Some(Self::host_config(spec)),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| SandboxError::Creation(e.into()))?;

        for warning in &response.warnings {
            log::warn!("Container {}: {warning}", response.id);
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Start {
                id: id.to_string(),
                source: e.into(),
            })
    }

    async fn wait(&self, id: &str) -> Result<i64, SandboxError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // The daemon reports non-zero exits through the error channel
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::Wait {
                id: id.to_string(),
                source: e.into(),
            }),
            None => Err(SandboxError::Wait {
                id: id.to_string(),
                source: "wait stream ended without a status".into(),
            }),
        }
    }

    async fn logs(&self, id: &str) -> Result<Vec<u8>, SandboxError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };

        let mut output = Vec::new();
        let mut stream = self.docker.logs(id, Some(options));
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SandboxError::Logs {
                id: id.to_string(),
                source: e.into(),
            })?;
            output.extend_from_slice(&chunk.into_bytes());
        }

        Ok(output)
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(SandboxError::Removal {
                id: id.to_string(),
                source: e.into(),
            }),
        }
    }
}
