//! `refresh_mysql`: brings a reused MySQL/MariaDB container back to a known
//! state by dropping the application databases and replaying the init scripts.
//!
//! Everything runs through the `mysql` client inside the container, so the
//! host needs no driver and no published port.

use crate::domain::ContainerSpec;
use crate::services::ContainerHandle;
use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const INIT_PATH_ENV: &str = "MYSQL_INIT_PATH";

const SYSTEM_DATABASES: [&str; 4] = ["information_schema", "mysql", "performance_schema", "sys"];
const INIT_DIR_CANDIDATES: [&str; 2] = ["resource", "test"];

pub async fn refresh_mysql(handle: Arc<ContainerHandle>) -> Result<()> {
    let cwd = std::env::current_dir().context("reading working directory")?;
    let init_dir = sql_init_dir(std::env::var(INIT_PATH_ENV).ok(), &cwd);
    refresh(&handle, init_dir).await
}

/// Clean then init. A container created by this run has nothing to clean,
/// and without init scripts nothing to apply either.
async fn refresh(handle: &ContainerHandle, init_dir: Option<PathBuf>) -> Result<()> {
    let client = MysqlClient::from_spec(handle.spec());
    if handle.is_fresh() {
        debug!("{} freshly created, skipping clean", handle.name());
    } else {
        client.clean(handle).await?;
    }

    match init_dir {
        Some(dir) => client.init(handle, &dir).await,
        None if handle.is_fresh() => {
            debug!("{} no sql init directory", handle.name());
            Ok(())
        }
        None => bail!("no sql init directory found, set {INIT_PATH_ENV}"),
    }
}

/// `override_dir` when set, else the nearest `resource/` or `test/`
/// directory walking up from `cwd`.
fn sql_init_dir(override_dir: Option<String>, cwd: &Path) -> Option<PathBuf> {
    if let Some(dir) = override_dir.filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir));
    }

    cwd.ancestors()
        .take_while(|dir| dir.parent().is_some())
        .flat_map(|dir| INIT_DIR_CANDIDATES.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_dir())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MysqlClient {
    user: String,
    password: Option<String>,
}

impl MysqlClient {
    fn from_spec(spec: &ContainerSpec) -> Self {
        let non_empty = |key: &str| spec.env_value(key).filter(|v| !v.is_empty());

        let user = non_empty("MYSQL_USER").unwrap_or("root").to_string();
        let password = non_empty("MYSQL_PASSWORD")
            .or_else(|| non_empty("MYSQL_ROOT_PASSWORD"))
            .map(String::from);

        Self { user, password }
    }

    fn command(&self, sql: &str) -> Vec<String> {
        let mut cmd = vec!["mysql".to_string(), format!("-u{}", self.user)];
        if let Some(password) = &self.password {
            cmd.push(format!("-p{password}"));
        }
        cmd.extend(["-N", "-B", "-e"].map(String::from));
        cmd.push(sql.to_string());
        cmd
    }

    async fn clean(&self, handle: &ContainerHandle) -> Result<()> {
        let listing = handle
            .exec(&self.command("SHOW DATABASES"))
            .await
            .context("listing databases")?;

        let databases = business_databases(&listing.output);
        if databases.is_empty() {
            return Ok(());
        }

        let drops: Vec<String> = databases
            .iter()
            .map(|db| format!("DROP DATABASE `{db}`"))
            .collect();
        handle
            .exec(&self.command(&drops.join("; ")))
            .await
            .context("dropping databases")?;

        info!("{} dropped {}", handle.name(), databases.join(", "));
        Ok(())
    }

    async fn init(&self, handle: &ContainerHandle, dir: &Path) -> Result<()> {
        for path in sql_files(dir).await? {
            let script = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("read {:?}", path))?;
            handle
                .exec(&self.command(&script))
                .await
                .with_context(|| format!("exec {:?}", path))?;
            debug!("{} applied {:?}", handle.name(), path.file_name());
        }
        Ok(())
    }
}

/// Database names from `SHOW DATABASES` output, without the system schemas
/// and the client's own warning lines.
fn business_databases(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("mysql:"))
        .filter(|line| !SYSTEM_DATABASES.contains(line))
        .map(String::from)
        .collect()
}

/// `*.sql` files of `dir`, sorted by name.
async fn sql_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("read path: {:?}", dir))?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file()
            && path.extension().is_some_and(|ext| ext == "sql")
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
