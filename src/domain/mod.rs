mod container;
pub mod image;
pub mod traits;

pub use container::{BindMount, ContainerSpec, ContainerState, HealthCheckSpec, Hook, PortBinding};
pub use image::ImageRef;
pub use traits::{
    ContainerHealthStatus, ContainerInspect, ContainerRuntime, ExecOutcome, LogStream,
    PullProgress, PullStream, RuntimeError,
};
