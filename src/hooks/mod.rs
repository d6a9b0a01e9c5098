//! Custom hooks shipped with testpool.

mod mysql;

pub use mysql::refresh_mysql;

use crate::services::HookRegistry;

pub fn register_builtins(registry: &mut HookRegistry) {
    registry.register("refresh_mysql", refresh_mysql);
}
