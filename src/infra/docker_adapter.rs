use crate::domain::{
    BindMount, ContainerHealthStatus, ContainerInspect, ContainerRuntime, ContainerSpec,
    ContainerState, ExecOutcome, HealthCheckSpec, LogStream, PortBinding, PullProgress,
    PullStream, RuntimeError,
};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{
    HealthConfig, HealthStatusEnum, HostConfig, Mount, MountTypeEnum,
    PortBinding as DockerPortBinding,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// `ContainerRuntime` backed by the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerAdapter {
    docker: Docker,
}

impl DockerAdapter {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connects using `DOCKER_HOST` or the local socket and checks the
    /// daemon answers.
    pub async fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().map_err(RuntimeError::from)?;
        let version = docker.ping().await.map_err(RuntimeError::from)?;
        debug!("docker daemon ping: {version}");
        Ok(Self::new(docker))
    }
}

impl From<DockerError> for RuntimeError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            DockerError::DockerResponseServerError {
                status_code: 409,
                message,
            } => RuntimeError::Conflict(message),
            err @ (DockerError::IOError { .. }
            | DockerError::HyperResponseError { .. }
            | DockerError::RequestTimeoutError
            | DockerError::SocketNotFoundError(_)) => RuntimeError::Unavailable(err.to_string()),
            err => RuntimeError::Api(err.to_string()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerAdapter {
    async fn list_image_tags(&self) -> Result<Vec<String>, RuntimeError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;

        Ok(images
            .into_iter()
            .flat_map(|image| image.repo_tags)
            .collect())
    }

    fn pull_image(&self, reference: &str) -> PullStream {
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };

        self.docker
            .create_image(Some(options), None, None)
            .map(|item| {
                item.map(|info| PullProgress {
                    status: info.status.unwrap_or_default(),
                    progress: info.progress,
                })
                .map_err(RuntimeError::from)
            })
            .boxed()
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await?;

        for warning in &response.warnings {
            debug!("{} create warning: {warning}", spec.name);
        }
        Ok(response.id)
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInspect, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;

        let state = inspect.state.unwrap_or_default();
        let running = if state.running == Some(true) {
            ContainerState::Running
        } else {
            ContainerState::Stopped
        };
        let health = match state.health.and_then(|h| h.status) {
            Some(HealthStatusEnum::HEALTHY) => ContainerHealthStatus::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => ContainerHealthStatus::Unhealthy,
            Some(HealthStatusEnum::STARTING) => ContainerHealthStatus::Starting,
            Some(HealthStatusEnum::NONE) | None => ContainerHealthStatus::NotApplicable,
            Some(_) => ContainerHealthStatus::Unknown,
        };

        Ok(ContainerInspect {
            id: inspect.id.unwrap_or_default(),
            state: running,
            health,
        })
    }

    fn logs(&self, name: &str, follow: bool) -> LogStream {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        self.docker
            .logs(name, Some(options))
            .map(|item| {
                item.map(|output| output.into_bytes().to_vec())
                    .map_err(RuntimeError::from)
            })
            .boxed()
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutcome, RuntimeError> {
        let options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self.docker.create_exec(name, options).await?;
        let mut output = String::new();

        if let StartExecResults::Attached { output: mut stream, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = stream.next().await {
                output.push_str(&String::from_utf8_lossy(&chunk?.into_bytes()));
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutcome {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    async fn kill_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(name, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker.remove_container(name, Some(options)).await?;
        Ok(())
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let env = (!spec.env.is_empty()).then(|| spec.env.clone());
    let cmd = (!spec.command.is_empty()).then(|| spec.command.clone());

    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .ports
        .iter()
        .map(|port| (port.container_key(), HashMap::new()))
        .collect();

    let host_config = HostConfig {
        port_bindings: Some(port_bindings(&spec.ports)),
        mounts: Some(spec.mounts.iter().map(bind_mount).collect()),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.canonical()),
        env,
        cmd,
        exposed_ports: Some(exposed_ports),
        healthcheck: spec.healthcheck.as_ref().map(health_config),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn port_bindings(ports: &[PortBinding]) -> HashMap<String, Option<Vec<DockerPortBinding>>> {
    let mut bindings: HashMap<String, Option<Vec<DockerPortBinding>>> = HashMap::new();
    for port in ports {
        bindings
            .entry(port.container_key())
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(DockerPortBinding {
                host_ip: Some(port.host_ip.clone()),
                host_port: Some(port.host_port.to_string()),
            });
    }
    bindings
}

fn bind_mount(mount: &BindMount) -> Mount {
    Mount {
        source: Some(mount.source.to_string_lossy().into_owned()),
        target: Some(mount.target.clone()),
        typ: Some(MountTypeEnum::BIND),
        read_only: Some(mount.read_only),
        ..Default::default()
    }
}

fn health_config(check: &HealthCheckSpec) -> HealthConfig {
    let nanos = |d: Option<Duration>| d.map(|d| d.as_nanos() as i64);

    HealthConfig {
        test: Some(check.test.clone()),
        interval: nanos(check.interval),
        timeout: nanos(check.timeout),
        retries: check.retries.map(i64::from),
        start_period: nanos(check.start_period),
        ..Default::default()
    }
}
