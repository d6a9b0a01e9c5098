pub mod cli;
pub mod domain;
pub mod error;
pub mod hooks;
pub mod infra;
pub mod services;

// Make test_support available for integration tests
// In a real production crate, we might use a feature flag "test-utils"
pub mod test_support;

pub use domain::{ContainerRuntime, ContainerSpec, ContainerState, Hook, ImageRef, RuntimeError};
pub use error::PoolError;
pub use infra::{DockerAdapter, PoolConfig};
pub use services::{ContainerHandle, CustomHook, HookRegistry, Pool, PoolOptions, PoolState, PullMode};
