use crate::services::ContainerHandle;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Custom post-start routine, referenced from configuration by name.
#[async_trait]
pub trait CustomHook: Send + Sync {
    async fn run(&self, handle: Arc<ContainerHandle>) -> Result<()>;
}

#[async_trait]
impl<F, Fut> CustomHook for F
where
    F: Fn(Arc<ContainerHandle>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self, handle: Arc<ContainerHandle>) -> Result<()> {
        (self)(handle).await
    }
}

/// Name → hook mapping, filled once at startup and read-only afterwards.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn CustomHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the hooks shipped with testpool.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::hooks::register_builtins(&mut registry);
        registry
    }

    /// Adds a hook.
    ///
    /// # Panics
    ///
    /// Panics when `name` is already registered: two hooks claiming the same
    /// name is a build mistake, not something to recover from at runtime.
    pub fn register(&mut self, name: impl Into<String>, hook: impl CustomHook + 'static) {
        let name = name.into();
        if self.hooks.contains_key(&name) {
            panic!("{name} already registered");
        }
        self.hooks.insert(name, Arc::new(hook));
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn CustomHook>> {
        self.hooks.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.hooks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop(_handle: Arc<ContainerHandle>) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_lookup_registered_hook() {
        let mut registry = HookRegistry::new();
        registry.register("noop", noop);

        assert!(registry.lookup("noop").is_some());
        assert!(registry.lookup("refresh_pg").is_none());
        assert_eq!(registry.names(), vec!["noop"]);
    }

    #[test]
    #[should_panic(expected = "noop already registered")]
    fn test_duplicate_registration_panics() {
        let mut registry = HookRegistry::new();
        registry.register("noop", noop);
        registry.register("noop", noop);
    }

    #[test]
    fn test_builtins_include_mysql_refresh() {
        let registry = HookRegistry::with_builtins();
        assert!(registry.lookup("refresh_mysql").is_some());
    }
}
