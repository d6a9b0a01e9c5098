use crate::domain::{
    ContainerHealthStatus, ContainerInspect, ContainerRuntime, ContainerSpec, ContainerState,
    ExecOutcome, ImageRef, LogStream, PullProgress, PullStream, RuntimeError,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct MockContainer {
    pub name: String,
    pub state: ContainerState,
    pub spec: Option<ContainerSpec>,
    pub health_status: Option<ContainerHealthStatus>,
    pub exec_exit_code: i64,
    pub exec_output: String,
    pub log_lines: Vec<Vec<u8>>,
}

impl MockContainer {
    fn new(name: &str, state: ContainerState) -> Self {
        Self {
            name: name.to_string(),
            state,
            spec: None,
            health_status: None,
            exec_exit_code: 0,
            exec_output: String::new(),
            log_lines: Vec::new(),
        }
    }
}

/// In-memory runtime recording every call as `op:name`.
#[derive(Debug)]
pub struct MockRuntime {
    containers: RwLock<HashMap<String, MockContainer>>,
    images: RwLock<HashSet<String>>,
    commands: RwLock<Vec<String>>,
    fail_on: RwLock<Option<String>>,
    start_delay: RwLock<Option<Duration>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            images: RwLock::new(HashSet::new()),
            commands: RwLock::new(Vec::new()),
            fail_on: RwLock::new(None),
            start_delay: RwLock::new(None),
        }
    }

    pub fn add_container(&self, name: &str, state: ContainerState) {
        self.containers
            .write()
            .unwrap()
            .insert(name.to_string(), MockContainer::new(name, state));
    }

    /// Registers a local image under its familiar tag.
    pub fn add_image(&self, reference: &str) {
        let tag = ImageRef::parse(reference)
            .map(|image| image.familiar())
            .unwrap_or_else(|_| reference.to_string());
        self.images.write().unwrap().insert(tag);
    }

    pub fn has_image(&self, tag: &str) -> bool {
        self.images.read().unwrap().contains(tag)
    }

    /// Fails every call of `operation`, or only the one for a container
    /// when given as `operation:name`.
    pub fn set_fail_on(&self, operation: &str) {
        *self.fail_on.write().unwrap() = Some(operation.to_string());
    }

    pub fn clear_fail_on(&self) {
        *self.fail_on.write().unwrap() = None;
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.write().unwrap() = Some(delay);
    }

    pub fn get_commands(&self) -> Vec<String> {
        self.commands.read().unwrap().clone()
    }

    pub fn count_commands(&self, prefix: &str) -> usize {
        self.commands
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn container_exists(&self, name: &str) -> bool {
        self.containers.read().unwrap().contains_key(name)
    }

    pub fn get_state(&self, name: &str) -> Option<ContainerState> {
        self.containers
            .read()
            .unwrap()
            .get(name)
            .map(|c| c.state.clone())
    }

    pub fn get_spec(&self, name: &str) -> Option<ContainerSpec> {
        self.containers
            .read()
            .unwrap()
            .get(name)
            .and_then(|c| c.spec.clone())
    }

    pub fn set_health_status(&self, name: &str, status: ContainerHealthStatus) {
        if let Some(container) = self.containers.write().unwrap().get_mut(name) {
            container.health_status = Some(status);
        }
    }

    pub fn set_exec_exit_code(&self, name: &str, code: i64) {
        if let Some(container) = self.containers.write().unwrap().get_mut(name) {
            container.exec_exit_code = code;
        }
    }

    pub fn set_exec_output(&self, name: &str, output: &str) {
        if let Some(container) = self.containers.write().unwrap().get_mut(name) {
            container.exec_output = output.to_string();
        }
    }

    pub fn set_log_lines(&self, name: &str, lines: Vec<Vec<u8>>) {
        if let Some(container) = self.containers.write().unwrap().get_mut(name) {
            container.log_lines = lines;
        }
    }

    fn record_command(&self, cmd: &str) {
        self.commands.write().unwrap().push(cmd.to_string());
    }

    fn check_fail(&self, operation: &str, name: &str) -> Result<(), RuntimeError> {
        if let Some(ref fail_on) = *self.fail_on.read().unwrap() {
            if fail_on == operation || *fail_on == format!("{operation}:{name}") {
                return Err(RuntimeError::Api(format!("Mock failure on: {operation}")));
            }
        }
        Ok(())
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_image_tags(&self) -> Result<Vec<String>, RuntimeError> {
        self.record_command("list_images");
        if self.check_fail("list_images", "").is_err() {
            return Err(RuntimeError::Unavailable("Mock daemon down".to_string()));
        }

        Ok(self.images.read().unwrap().iter().cloned().collect())
    }

    fn pull_image(&self, reference: &str) -> PullStream {
        self.record_command(&format!("pull:{}", reference));
        if let Err(e) = self.check_fail("pull", reference) {
            return stream::iter(vec![Err(e)]).boxed();
        }

        self.add_image(reference);
        stream::iter(vec![
            Ok(PullProgress {
                status: "Pulling fs layer".to_string(),
                progress: None,
            }),
            Ok(PullProgress {
                status: "Downloading".to_string(),
                progress: Some("[=====>    ] 1MB/2MB".to_string()),
            }),
        ])
        .boxed()
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record_command(&format!("create:{}", spec.name));
        self.check_fail("create", &spec.name)?;

        let mut containers = self.containers.write().unwrap();
        if containers.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict(format!(
                "container name {} already in use",
                spec.name
            )));
        }

        let mut container = MockContainer::new(&spec.name, ContainerState::Stopped);
        container.spec = Some(spec.clone());
        containers.insert(spec.name.clone(), container);

        Ok(format!("id-{}", spec.name))
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.record_command(&format!("start:{}", name));
        let delay = *self.start_delay.read().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_fail("start", name)?;

        match self.containers.write().unwrap().get_mut(name) {
            Some(container) => {
                container.state = ContainerState::Running;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInspect, RuntimeError> {
        self.record_command(&format!("inspect:{}", name));
        self.check_fail("inspect", name)?;

        let containers = self.containers.read().unwrap();
        let container = containers
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;

        Ok(ContainerInspect {
            id: format!("id-{}", name),
            state: container.state.clone(),
            health: container
                .health_status
                .clone()
                .unwrap_or(ContainerHealthStatus::NotApplicable), // Default if not explicitly set
        })
    }

    fn logs(&self, name: &str, follow: bool) -> LogStream {
        self.record_command(&format!("logs:{}", name));
        if let Err(e) = self.check_fail("logs", name) {
            return stream::iter(vec![Err(e)]).boxed();
        }

        let lines: Vec<Result<Vec<u8>, RuntimeError>> = self
            .containers
            .read()
            .unwrap()
            .get(name)
            .map(|c| c.log_lines.iter().cloned().map(Ok).collect())
            .unwrap_or_default();

        if follow {
            // A followed stream of a live container never ends on its own.
            stream::iter(lines)
                .chain(stream::pending::<Result<Vec<u8>, RuntimeError>>())
                .boxed()
        } else {
            stream::iter(lines).boxed()
        }
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutcome, RuntimeError> {
        self.record_command(&format!("exec:{}:{}", name, command.join(" ")));
        self.check_fail("exec", name)?;

        let containers = self.containers.read().unwrap();
        let container = containers
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;

        Ok(ExecOutcome {
            exit_code: container.exec_exit_code,
            output: container.exec_output.clone(),
        })
    }

    async fn kill_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.record_command(&format!("kill:{}", name));
        self.check_fail("kill", name)?;

        match self.containers.write().unwrap().get_mut(name) {
            Some(container) => {
                container.state = ContainerState::Stopped;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.record_command(&format!("remove:{}", name));
        self.check_fail("remove", name)?;

        match self.containers.write().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }
}
