use super::{ContainerSpec, ContainerState};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerHealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    Unknown,
    NotApplicable, // No healthcheck configured
}

/// Snapshot of what the runtime reports for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInspect {
    pub id: String,
    pub state: ContainerState,
    pub health: ContainerHealthStatus,
}

/// One progress message of an image pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullProgress {
    pub status: String,
    pub progress: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub output: String,
}

pub type PullStream = BoxStream<'static, Result<PullProgress, RuntimeError>>;

/// Raw log chunks; may still carry the 8-byte multiplexing header.
pub type LogStream = BoxStream<'static, Result<Vec<u8>, RuntimeError>>;

/// Failure kinds of the container runtime.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("runtime api error: {0}")]
    Api(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Trait for container runtime operations
///
/// Implementations must be safe for concurrent use: the pool shares one
/// instance across every startup task.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + Debug {
    /// Tags of every image available locally
    async fn list_image_tags(&self) -> Result<Vec<String>, RuntimeError>;

    /// Pull an image by canonical reference
    fn pull_image(&self, reference: &str) -> PullStream;

    /// Create a container named `spec.name`, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Start a container
    async fn start_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// Inspect a container; `RuntimeError::NotFound` when it does not exist
    async fn inspect_container(&self, name: &str) -> Result<ContainerInspect, RuntimeError>;

    /// Stream stdout and stderr of a container
    fn logs(&self, name: &str, follow: bool) -> LogStream;

    /// Run a command inside a running container and wait for it to finish
    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutcome, RuntimeError>;

    /// Send SIGKILL to a container
    async fn kill_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// Force remove a container together with its anonymous volumes
    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;
}
