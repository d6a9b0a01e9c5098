use crate::domain::{ContainerRuntime, ContainerSpec, Hook};
use crate::error::{PoolError, Result};
use crate::services::log_forwarder::forward_logs;
use crate::services::{ContainerHandle, HookRegistry};
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const DEFAULT_HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_UNHEALTHY_LOG_WINDOW: Duration = Duration::from_secs(10);

/// How `pull_all` walks the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PullMode {
    /// Every handle pulls its image if missing.
    #[default]
    Independent,
    /// Stop at the first handle whose image is already present, leaving the
    /// handles declared after it unpulled.
    StopAtFirstPresent,
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub pull_mode: PullMode,
    pub health_poll_interval: Duration,
    pub unhealthy_log_window: Duration,
    /// Upper bound for `wait_healthy`; `None` waits until the pool is closed.
    pub health_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            pull_mode: PullMode::default(),
            health_poll_interval: DEFAULT_HEALTH_POLL_INTERVAL,
            unhealthy_log_window: DEFAULT_UNHEALTHY_LOG_WINDOW,
            health_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Empty,
    Populated,
    Pulling,
    Starting,
    WaitingHealthy,
    Ready,
    Running,
    Failed,
    Closing,
    Purged,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Owns the containers of one test invocation and drives them through
/// pull → create/start → health wait → hooks, then close → purge.
pub struct Pool {
    runtime: Arc<dyn ContainerRuntime>,
    hooks: Arc<HookRegistry>,
    options: PoolOptions,
    containers: Vec<Arc<ContainerHandle>>,
    cancel: CancellationToken,
    log_tasks: TaskTracker,
    state: Mutex<PoolState>,
}

impl Pool {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, hooks: Arc<HookRegistry>) -> Self {
        Self::with_options(runtime, hooks, PoolOptions::default())
    }

    pub fn with_options(
        runtime: Arc<dyn ContainerRuntime>,
        hooks: Arc<HookRegistry>,
        options: PoolOptions,
    ) -> Self {
        Self {
            runtime,
            hooks,
            options,
            containers: Vec::new(),
            cancel: CancellationToken::new(),
            log_tasks: TaskTracker::new(),
            state: Mutex::new(PoolState::Empty),
        }
    }

    /// Adds a container. Only valid before `start`.
    pub fn add(&mut self, spec: ContainerSpec) -> Result<()> {
        let state = self.state();
        if !matches!(state, PoolState::Empty | PoolState::Populated) {
            return Err(PoolError::InvalidState(format!(
                "cannot add {} while pool is {state}",
                spec.name
            )));
        }

        self.containers
            .push(Arc::new(ContainerHandle::new(self.runtime.clone(), spec)));
        self.set_state(PoolState::Populated);
        Ok(())
    }

    pub fn handles(&self) -> &[Arc<ContainerHandle>] {
        &self.containers
    }

    pub fn handle(&self, name: &str) -> Option<&Arc<ContainerHandle>> {
        self.containers.iter().find(|ct| ct.name() == name)
    }

    pub fn state(&self) -> PoolState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: PoolState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Token cancelled by `close`; hand a clone to signal handlers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Pulls, starts, waits for health and runs hooks, stopping at the first
    /// failing stage.
    pub async fn start(&self) -> Result<()> {
        let result = self.run_stages().await;
        match &result {
            Ok(()) => self.set_state(PoolState::Running),
            Err(_) if self.is_closed() => {}
            Err(_) => self.set_state(PoolState::Failed),
        }
        result
    }

    async fn run_stages(&self) -> Result<()> {
        self.pull_all().await?;
        self.start_all_not_running().await?;
        self.wait_healthy().await?;
        self.run_hooks().await
    }

    pub async fn pull_all(&self) -> Result<()> {
        self.set_state(PoolState::Pulling);

        for ct in &self.containers {
            let Some(mut progress) = ct.pull_if_missing().await? else {
                if self.options.pull_mode == PullMode::StopAtFirstPresent {
                    debug!("{} present, skipping remaining pulls", ct.image());
                    return Ok(());
                }
                continue;
            };

            info!("{}: pulling image...", ct.image());
            while let Some(item) = progress.next().await {
                let item = item.map_err(|source| PoolError::ImagePull {
                    image: ct.image().familiar(),
                    source,
                })?;
                match item.progress {
                    Some(p) => info!("{}: Status: {} Progress: {}", ct.image(), item.status, p),
                    None => info!("{}: Status: {}", ct.image(), item.status),
                }
            }
        }

        Ok(())
    }

    /// Creates (when missing) and starts every container that is not running,
    /// all at once. Returns the first failure; the other tasks keep going.
    pub async fn start_all_not_running(&self) -> Result<()> {
        self.set_state(PoolState::Starting);

        let mut not_running = Vec::new();
        for ct in &self.containers {
            if ct.running().await? {
                debug!("{} already running", ct.name());
            } else {
                not_running.push(ct.clone());
            }
        }

        let mut tasks = JoinSet::new();
        for ct in not_running {
            let cancel = self.cancel.clone();
            let log_tasks = self.log_tasks.clone();
            tasks.spawn(async move { start_container(ct, cancel, log_tasks).await });
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(PoolError::InvalidState(format!("start task failed: {e}")))
            });
            if let Err(e) = outcome {
                tasks.detach_all();
                return Err(e);
            }
        }

        Ok(())
    }

    /// Polls until every container reports healthy in the same round.
    pub async fn wait_healthy(&self) -> Result<()> {
        self.set_state(PoolState::WaitingHealthy);

        let started = Instant::now();
        let deadline = self.options.health_timeout.map(|t| started + t);
        let mut tracker = UnhealthyTracker::new(self.options.unhealthy_log_window);

        loop {
            if self.is_closed() {
                debug!("health wait aborted");
                return Err(PoolError::HealthPollAborted);
            }

            let mut pending = Vec::new();
            for ct in &self.containers {
                let healthy = match ct.healthy().await {
                    Ok(healthy) => healthy,
                    Err(e) => {
                        debug!("{} health check: {e}", ct.name());
                        false
                    }
                };

                if healthy {
                    tracker.clear(ct.name());
                } else {
                    if tracker.observe(ct.name(), Instant::now()) {
                        warn!("{} health check: unhealthy", ct.image());
                    }
                    pending.push(ct.name().to_string());
                }
            }

            if pending.is_empty() {
                info!("all containers healthy");
                self.set_state(PoolState::Ready);
                return Ok(());
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(PoolError::HealthTimeout {
                        pending,
                        waited: started.elapsed(),
                    });
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("health wait aborted");
                    return Err(PoolError::HealthPollAborted);
                }
                _ = tokio::time::sleep(self.options.health_poll_interval) => {}
            }
        }
    }

    /// Runs every hook in declaration order; the first failure stops the run.
    pub async fn run_hooks(&self) -> Result<()> {
        for ct in &self.containers {
            for hook in &ct.spec().hooks {
                match hook {
                    Hook::Exec { command } => {
                        info!("{} run hook cmd {:?}", ct.image(), command);
                        ct.exec(command).await?;
                    }
                    Hook::Custom { name } => {
                        let custom = self
                            .hooks
                            .lookup(name)
                            .ok_or_else(|| PoolError::UnknownHook(name.clone()))?;
                        info!("{} run hook {name}", ct.image());
                        custom
                            .run(ct.clone())
                            .await
                            .map_err(|source| PoolError::Hook {
                                container: ct.name().to_string(),
                                hook: name.clone(),
                                source,
                            })?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Cancels the pool and waits for the log forwarders to finish. Does not
    /// touch the containers.
    pub async fn close(&self) {
        if !self.is_closed() {
            self.set_state(PoolState::Closing);
        }
        self.cancel.cancel();
        self.log_tasks.close();
        self.log_tasks.wait().await;
    }

    /// Removes every container that is still running. Failures are logged and
    /// do not stop the others.
    pub async fn purge(&self) {
        for ct in &self.containers {
            match ct.running().await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!("{} inspect err: {e}", ct.name());
                    continue;
                }
            }

            match ct.remove().await {
                Ok(()) => info!("removed container {}", ct.name()),
                Err(e) => warn!("{} remove err: {e}", ct.name()),
            }
        }
        self.set_state(PoolState::Purged);
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field(
                "containers",
                &self.containers.iter().map(|ct| ct.name()).collect::<Vec<_>>(),
            )
            .field("state", &self.state())
            .field("options", &self.options)
            .finish()
    }
}

async fn start_container(
    ct: Arc<ContainerHandle>,
    cancel: CancellationToken,
    log_tasks: TaskTracker,
) -> Result<()> {
    let created = !ct.exists().await?;
    if created {
        info!("creating {} ({})", ct.name(), ct.image());
        ct.create().await?;
    }

    info!("starting {}", ct.name());
    ct.start().await?;
    if created {
        ct.mark_fresh();
    }

    let stream = ct.logs(true);
    log_tasks.spawn(forward_logs(
        ct.name().to_string(),
        ct.image().familiar(),
        stream,
        cancel,
    ));

    Ok(())
}

/// Throttles "still unhealthy" warnings to one per container per window.
#[derive(Debug)]
pub struct UnhealthyTracker {
    window: Duration,
    since: HashMap<String, Instant>,
}

impl UnhealthyTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            since: HashMap::new(),
        }
    }

    /// Records an unhealthy observation; true when a warning is due. The
    /// first observation only starts the clock.
    pub fn observe(&mut self, name: &str, now: Instant) -> bool {
        let since = self.since.entry(name.to_string()).or_insert(now);
        if now.duration_since(*since) > self.window {
            *since = now;
            return true;
        }
        false
    }

    pub fn clear(&mut self, name: &str) {
        self.since.remove(name);
    }
}
