use crate::domain::{
    ContainerHealthStatus, ContainerInspect, ContainerRuntime, ContainerSpec, ContainerState,
    ExecOutcome, ImageRef, LogStream, PullStream, RuntimeError,
};
use crate::error::{PoolError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Binding between a declared spec and the runtime container of the same name.
#[derive(Debug)]
pub struct ContainerHandle {
    runtime: Arc<dyn ContainerRuntime>,
    spec: ContainerSpec,
    fresh: AtomicBool,
    id: OnceLock<String>,
}

impl ContainerHandle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, spec: ContainerSpec) -> Self {
        Self {
            runtime,
            spec,
            fresh: AtomicBool::new(false),
            id: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn image(&self) -> &ImageRef {
        &self.spec.image
    }

    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    /// True iff this run created the container instead of attaching to an existing one.
    pub fn is_fresh(&self) -> bool {
        self.fresh.load(Ordering::Acquire)
    }

    /// Container id, known once this run created the container.
    pub fn id(&self) -> Option<&str> {
        self.id.get().map(String::as_str)
    }

    pub async fn pull_if_missing(&self) -> Result<Option<PullStream>> {
        let tags = self
            .runtime
            .list_image_tags()
            .await
            .map_err(PoolError::RuntimeUnavailable)?;

        if tags.iter().any(|tag| self.spec.image.matches_tag(tag)) {
            debug!("{} already present locally", self.spec.image);
            return Ok(None);
        }

        Ok(Some(self.runtime.pull_image(&self.spec.image.canonical())))
    }

    /// Creates the container. Callers check `exists()` first; a name clash
    /// surfaces as `CreateConflict`.
    pub async fn create(&self) -> Result<()> {
        let id = self
            .runtime
            .create_container(&self.spec)
            .await
            .map_err(|source| match source {
                RuntimeError::Conflict(_) => PoolError::CreateConflict {
                    image: self.spec.image.familiar(),
                    source,
                },
                source => PoolError::CreateFailure {
                    image: self.spec.image.familiar(),
                    source,
                },
            })?;

        debug!("{} created with id {id}", self.spec.name);
        let _ = self.id.set(id);
        Ok(())
    }

    /// Records that this run created and started the container.
    pub fn mark_fresh(&self) {
        self.fresh.store(true, Ordering::Release);
    }

    pub async fn start(&self) -> Result<()> {
        self.runtime
            .start_container(&self.spec.name)
            .await
            .map_err(|source| PoolError::StartFailure {
                image: self.spec.image.familiar(),
                source,
            })
    }

    /// Health as reported by the runtime. Without a declared probe the
    /// container is healthy by definition and the runtime is not asked.
    pub async fn healthy(&self) -> Result<bool> {
        if self.spec.healthcheck.is_none() {
            return Ok(true);
        }

        let inspect = self.runtime.inspect_container(&self.spec.name).await?;
        Ok(matches!(
            inspect.health,
            ContainerHealthStatus::Healthy | ContainerHealthStatus::NotApplicable
        ))
    }

    pub async fn running(&self) -> Result<bool> {
        Ok(self
            .inspect()
            .await?
            .is_some_and(|inspect| inspect.state == ContainerState::Running))
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(self.inspect().await?.is_some())
    }

    async fn inspect(&self) -> Result<Option<ContainerInspect>> {
        match self.runtime.inspect_container(&self.spec.name).await {
            Ok(inspect) => Ok(Some(inspect)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn logs(&self, follow: bool) -> LogStream {
        self.runtime.logs(&self.spec.name, follow)
    }

    /// Runs `command` in the container and waits for it. A non-zero exit
    /// code is an error.
    pub async fn exec(&self, command: &[String]) -> Result<ExecOutcome> {
        let outcome = self.runtime.exec(&self.spec.name, command).await?;

        if !outcome.output.is_empty() {
            debug!("{} exec {:?}: {}", self.spec.name, command, outcome.output.trim_end());
        }

        if outcome.exit_code != 0 {
            return Err(PoolError::ExecFailed {
                container: self.spec.name.clone(),
                command: command.to_vec(),
                exit_code: outcome.exit_code,
                output: outcome.output,
            });
        }

        Ok(outcome)
    }

    pub async fn kill(&self) -> Result<()> {
        Ok(self.runtime.kill_container(&self.spec.name).await?)
    }

    pub async fn remove(&self) -> Result<()> {
        Ok(self.runtime.remove_container(&self.spec.name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HealthCheckSpec;
    use crate::test_support::MockRuntime;
    use futures::StreamExt;

    fn handle(mock: &Arc<MockRuntime>, name: &str, image: &str) -> ContainerHandle {
        let spec = ContainerSpec::new(name, ImageRef::parse(image).unwrap());
        ContainerHandle::new(mock.clone(), spec)
    }

    #[tokio::test]
    async fn test_pull_if_missing_skips_present_image() {
        let mock = Arc::new(MockRuntime::new());
        mock.add_image("redis:4");
        let ct = handle(&mock, "cache", "docker.io/library/redis:4");

        let stream = ct.pull_if_missing().await.unwrap();

        assert!(stream.is_none());
        assert!(!mock.get_commands().iter().any(|c| c.starts_with("pull:")));
    }

    #[tokio::test]
    async fn test_pull_if_missing_pulls_canonical_reference() {
        let mock = Arc::new(MockRuntime::new());
        let ct = handle(&mock, "cache", "redis");

        let stream = ct.pull_if_missing().await.unwrap().expect("pull stream");
        let progress: Vec<_> = stream.collect().await;

        assert!(!progress.is_empty());
        assert!(
            mock.get_commands()
                .contains(&"pull:docker.io/library/redis:latest".to_string())
        );
        assert!(mock.has_image("redis:latest"));
    }

    #[tokio::test]
    async fn test_pull_if_missing_reports_unavailable_runtime() {
        let mock = Arc::new(MockRuntime::new());
        mock.set_fail_on("list_images");
        let ct = handle(&mock, "cache", "redis");

        let err = ct.pull_if_missing().await.err().expect("should fail");
        assert!(matches!(err, PoolError::RuntimeUnavailable(_)));
    }

    #[tokio::test]
    async fn test_missing_container_is_not_an_error() {
        let mock = Arc::new(MockRuntime::new());
        let ct = handle(&mock, "cache", "redis");

        assert!(!ct.exists().await.unwrap());
        assert!(!ct.running().await.unwrap());
    }

    #[tokio::test]
    async fn test_create_caches_id_without_marking_fresh() {
        let mock = Arc::new(MockRuntime::new());
        let ct = handle(&mock, "cache", "redis");

        ct.create().await.unwrap();

        assert!(!ct.is_fresh());
        assert_eq!(ct.id(), Some("id-cache"));
        assert_eq!(mock.get_state("cache"), Some(ContainerState::Stopped));
    }

    #[tokio::test]
    async fn test_create_conflict_carries_image() {
        let mock = Arc::new(MockRuntime::new());
        mock.add_container("cache", ContainerState::Stopped);
        let ct = handle(&mock, "cache", "redis:4");

        let err = ct.create().await.unwrap_err();

        match err {
            PoolError::CreateConflict { image, .. } => assert_eq!(image, "redis:4"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!ct.is_fresh());
    }

    #[tokio::test]
    async fn test_healthy_without_probe_does_not_inspect() {
        let mock = Arc::new(MockRuntime::new());
        mock.add_container("cache", ContainerState::Running);
        mock.set_health_status("cache", ContainerHealthStatus::Unhealthy);
        let ct = handle(&mock, "cache", "redis");

        assert!(ct.healthy().await.unwrap());
        assert!(mock.get_commands().is_empty());
    }

    #[tokio::test]
    async fn test_healthy_follows_runtime_status() {
        let mock = Arc::new(MockRuntime::new());
        mock.add_container("db", ContainerState::Running);
        mock.set_health_status("db", ContainerHealthStatus::Starting);
        let mut spec = ContainerSpec::new("db", ImageRef::parse("mariadb:10.1").unwrap());
        spec.healthcheck = Some(HealthCheckSpec {
            test: vec!["CMD".into(), "mysqladmin".into(), "ping".into()],
            interval: None,
            timeout: None,
            retries: None,
            start_period: None,
        });
        let ct = ContainerHandle::new(mock.clone(), spec);

        assert!(!ct.healthy().await.unwrap());
        mock.set_health_status("db", ContainerHealthStatus::Healthy);
        assert!(ct.healthy().await.unwrap());
    }

    #[tokio::test]
    async fn test_exec_surfaces_non_zero_exit_code() {
        let mock = Arc::new(MockRuntime::new());
        mock.add_container("cache", ContainerState::Running);
        mock.set_exec_exit_code("cache", 127);
        let ct = handle(&mock, "cache", "redis");

        let err = ct.exec(&["redis-cli".to_string(), "flushall".to_string()]).await;

        match err {
            Err(PoolError::ExecFailed { exit_code, .. }) => assert_eq!(exit_code, 127),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remove_deletes_container() {
        let mock = Arc::new(MockRuntime::new());
        mock.add_container("cache", ContainerState::Running);
        let ct = handle(&mock, "cache", "redis");

        ct.remove().await.unwrap();

        assert!(!mock.container_exists("cache"));
        assert!(mock.get_commands().contains(&"remove:cache".to_string()));
    }
}
