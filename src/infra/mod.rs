pub mod config;
mod docker_adapter;

pub use config::{PoolConfig, find_config, load_config};
pub use docker_adapter::DockerAdapter;
