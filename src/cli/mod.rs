use crate::infra::config::{CONFIG_ENV, DEFAULT_CONFIG_NAME, DEFAULT_PREFIX, parse_duration};
use crate::infra::{DockerAdapter, find_config, load_config};
use crate::services::{HookRegistry, Pool, PoolOptions, PullMode};
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "testpool",
    version,
    about = "Starts the containers an integration test run needs, runs the tests, cleans up",
    after_help = "Examples:\n  \
        testpool -- cargo test          start, run the tests, remove the containers\n  \
        testpool -d -- cargo test       start or refresh, run the tests, keep the containers\n  \
        testpool -d                     start or refresh only\n  \
        testpool --rm                   remove the running containers"
)]
pub struct Cli {
    /// Pool config (default: testpool.yml in the current or a parent directory)
    #[arg(short, long, env = CONFIG_ENV, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Prefix of container names not set explicitly
    #[arg(long, default_value = DEFAULT_PREFIX)]
    pub prefix: String,

    /// Leave the containers running on exit
    #[arg(short, long, conflicts_with = "rm")]
    pub detach: bool,

    /// Remove the running containers and exit
    #[arg(long)]
    pub rm: bool,

    /// Give up when the containers are not healthy after this long (e.g. 90s, 2m)
    #[arg(long, value_name = "DUR", value_parser = parse_duration)]
    pub health_timeout: Option<Duration>,

    /// Stop pulling at the first image already present
    #[arg(long)]
    pub legacy_pull: bool,

    /// Test command
    #[arg(last = true, required_unless_present_any = ["detach", "rm"])]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Start, run the command, remove.
    Foreground,
    /// Start or refresh, optionally run the command, keep running.
    Detach,
    /// Remove only.
    Remove,
}

impl Cli {
    pub fn mode(&self) -> Mode {
        if self.rm {
            Mode::Remove
        } else if self.detach {
            Mode::Detach
        } else {
            Mode::Foreground
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            pull_mode: if self.legacy_pull {
                PullMode::StopAtFirstPresent
            } else {
                PullMode::Independent
            },
            health_timeout: self.health_timeout,
            ..PoolOptions::default()
        }
    }
}

/// Runs the CLI and returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    let config_path = resolve_config_path(cli.config.clone(), &std::env::current_dir()?)?;
    info!("using {:?}", config_path);

    let specs = load_config(&config_path)?.into_specs(&cli.prefix)?;
    let runtime = DockerAdapter::connect()
        .await
        .context("connecting to docker, is the daemon running?")?;

    let mut pool = Pool::with_options(
        Arc::new(runtime),
        Arc::new(HookRegistry::with_builtins()),
        cli.pool_options(),
    );
    for spec in specs {
        pool.add(spec)?;
    }

    match cli.mode() {
        Mode::Remove => {
            pool.close().await;
            pool.purge().await;
            Ok(0)
        }
        Mode::Detach => {
            let code = match start_pool(&pool).await {
                Some(code) => code,
                None if cli.command.is_empty() => 0,
                None => command_exit_code(&cli.command, pool.cancellation_token()).await,
            };
            pool.close().await;
            Ok(code)
        }
        Mode::Foreground => {
            let signals = tokio::spawn(cancel_on_signal(pool.cancellation_token()));

            let code = match start_pool(&pool).await {
                Some(code) => code,
                None => command_exit_code(&cli.command, pool.cancellation_token()).await,
            };

            signals.abort();
            pool.close().await;
            pool.purge().await;
            Ok(code)
        }
    }
}

/// Starts the pool; `Some(exit code)` when it did not come up.
async fn start_pool(pool: &Pool) -> Option<i32> {
    match pool.start().await {
        Ok(()) => {
            info!("🚀 {} container(s) ready", pool.handles().len());
            None
        }
        Err(e) if e.is_abort() => {
            debug!("{e}");
            Some(INTERRUPTED_EXIT_CODE)
        }
        Err(e) => {
            error!("start pool failed: {e}");
            Some(1)
        }
    }
}

/// `-c` / `TESTPOOL_CONFIG` when given, else the nearest `testpool.yml`.
fn resolve_config_path(explicit: Option<PathBuf>, cwd: &Path) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => find_config(cwd).ok_or_else(|| {
            anyhow!("no {DEFAULT_CONFIG_NAME} found in {:?} or its parents", cwd)
        }),
    }
}

async fn command_exit_code(command: &[String], cancel: CancellationToken) -> i32 {
    run_command(command, cancel).await.unwrap_or_else(|e| {
        error!("{e:#}");
        1
    })
}

/// Runs `command` with inherited stdio. Cancelling `cancel` kills it.
async fn run_command(command: &[String], cancel: CancellationToken) -> Result<i32> {
    let Some((program, args)) = command.split_first() else {
        return Ok(0);
    };

    info!("running {}", command.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .spawn()
        .with_context(|| format!("spawning {program}"))?;

    tokio::select! {
        status = child.wait() => {
            let status = status.with_context(|| format!("waiting for {program}"))?;
            Ok(status.code().unwrap_or(1))
        }
        _ = cancel.cancelled() => {
            warn!("interrupted, stopping {program}");
            if let Err(e) = child.kill().await {
                debug!("kill {program}: {e}");
            }
            Ok(INTERRUPTED_EXIT_CODE)
        }
    }
}

async fn cancel_on_signal(cancel: CancellationToken) {
    match shutdown_signal().await {
        Ok(name) => warn!("got {name}, shutting down"),
        Err(e) => {
            error!("listening for signals: {e}");
            return;
        }
    }
    cancel.cancel();
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
        _ = term.recv() => Ok("SIGTERM"),
        _ = hangup.recv() => Ok("SIGHUP"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
}
