mod container_handle;
mod hook_registry;
pub mod log_forwarder;
mod pool;

pub use container_handle::ContainerHandle;
pub use hook_registry::{CustomHook, HookRegistry};
pub use pool::{Pool, PoolOptions, PoolState, PullMode, UnhealthyTracker};
