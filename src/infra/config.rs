use crate::domain::{BindMount, ContainerSpec, HealthCheckSpec, Hook, ImageRef, PortBinding};
use anyhow::{Context, Result, bail};
use indexmap::IndexMap;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_NAME: &str = "testpool.yml";
pub const CONFIG_ENV: &str = "TESTPOOL_CONFIG";
pub const DEFAULT_PREFIX: &str = "testpool";

/// Parsed `testpool.yml`.
#[derive(Deserialize, Debug, Default)]
pub struct PoolConfig {
    #[serde(default)]
    pub version: Option<serde_yml::Value>,
    /// Services in declaration order.
    #[serde(default)]
    pub services: IndexMap<String, ServiceConfig>,
    /// Directory relative host paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServiceConfig {
    pub image: String,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub command: Option<CommandConfig>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default, alias = "Healthcheck")]
    pub healthcheck: Option<HealthcheckConfig>,
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
}

/// `command: "a b"` or `command: ["a", "b"]`.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum CommandConfig {
    Shell(String),
    Exec(Vec<String>),
}

impl CommandConfig {
    fn into_args(self) -> Vec<String> {
        match self {
            CommandConfig::Shell(s) => s.split_whitespace().map(String::from).collect(),
            CommandConfig::Exec(args) => args,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct HealthcheckConfig {
    pub test: CommandConfig,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub start_period: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct HookConfig {
    #[serde(default)]
    pub cmd: Option<CommandConfig>,
    #[serde(default)]
    pub custom: Option<String>,
}

impl PoolConfig {
    pub fn from_yaml(content: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut config: PoolConfig = serde_yml::from_str(content).context("parsing pool config")?;
        config.base_dir = base_dir.into();
        Ok(config)
    }

    /// Builds the ordered container specs; containers without an explicit
    /// `container_name` are named `<prefix>_<service>`.
    pub fn into_specs(self, prefix: &str) -> Result<Vec<ContainerSpec>> {
        let base_dir = self.base_dir;
        self.services
            .into_iter()
            .map(|(name, service)| {
                service_spec(&name, service, prefix, &base_dir)
                    .with_context(|| format!("service '{name}'"))
            })
            .collect()
    }
}

pub fn load_config(path: &Path) -> Result<PoolConfig> {
    let content = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let base_dir = fs::canonicalize(&base_dir).unwrap_or(base_dir);

    let config =
        PoolConfig::from_yaml(&content, base_dir).with_context(|| format!("parse of {:?}", path))?;
    debug!("loaded {} service(s) from {:?}", config.services.len(), path);
    Ok(config)
}

/// Walks up from `start` looking for `testpool.yml`.
pub fn find_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(DEFAULT_CONFIG_NAME))
        .find(|candidate| candidate.is_file())
}

fn service_spec(
    name: &str,
    service: ServiceConfig,
    prefix: &str,
    base_dir: &Path,
) -> Result<ContainerSpec> {
    validate_service_name(name)?;

    if service.image.trim().is_empty() {
        bail!("missing 'image'");
    }
    let image = ImageRef::parse(&service.image)?;

    let container_name = service
        .container_name
        .unwrap_or_else(|| format!("{prefix}_{name}"));
    let mut spec = ContainerSpec::new(container_name, image);

    spec.ports = service
        .ports
        .iter()
        .map(|p| p.parse::<PortBinding>())
        .collect::<Result<_>>()?;
    spec.mounts = service
        .volumes
        .iter()
        .map(|v| resolve_mount(v, base_dir))
        .collect::<Result<_>>()?;
    spec.env = service.environment;
    spec.command = service.command.map(CommandConfig::into_args).unwrap_or_default();
    spec.healthcheck = service.healthcheck.map(health_check).transpose()?;
    spec.hooks = service
        .hooks
        .into_iter()
        .map(hook)
        .collect::<Result<_>>()?;

    Ok(spec)
}

fn validate_service_name(name: &str) -> Result<()> {
    let Some(first) = name.chars().next() else {
        bail!("empty service name");
    };
    if !first.is_ascii_alphanumeric() {
        bail!("service name '{name}' must start with a letter or digit");
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '_' | '.' | '-'))
    {
        bail!("service name '{name}' contains invalid character '{c}'");
    }
    Ok(())
}

fn resolve_mount(volume: &str, base_dir: &Path) -> Result<BindMount> {
    let mut mount = BindMount::parse(volume)?;

    let raw = mount.source.to_string_lossy().into_owned();
    let expanded =
        shellexpand::full(&raw).with_context(|| format!("expanding volume source {raw}"))?;
    let source = PathBuf::from(expanded.as_ref());

    mount.source = if source.is_absolute() {
        source
    } else if source == Path::new(".") {
        base_dir.to_path_buf()
    } else {
        base_dir.join(source.strip_prefix("./").unwrap_or(&source))
    };
    Ok(mount)
}

fn health_check(config: HealthcheckConfig) -> Result<HealthCheckSpec> {
    let test = match config.test {
        CommandConfig::Exec(args) => args,
        CommandConfig::Shell(line) => vec!["CMD-SHELL".to_string(), line],
    };
    if test.is_empty() {
        bail!("empty healthcheck test");
    }

    let duration = |value: Option<String>| value.as_deref().map(parse_duration).transpose();

    Ok(HealthCheckSpec {
        test,
        interval: duration(config.interval)?,
        timeout: duration(config.timeout)?,
        retries: config.retries,
        start_period: duration(config.start_period)?,
    })
}

fn hook(config: HookConfig) -> Result<Hook> {
    match (config.cmd, config.custom) {
        (Some(cmd), None) => {
            let command = cmd.into_args();
            if command.is_empty() {
                bail!("hook 'cmd' is empty");
            }
            Ok(Hook::Exec { command })
        }
        (None, Some(name)) if !name.trim().is_empty() => Ok(Hook::Custom { name }),
        (None, Some(_)) => bail!("hook 'custom' is empty"),
        _ => bail!("hook must set exactly one of 'cmd' or 'custom'"),
    }
}

/// Parses `500ms`, `2s`, `5m`, `1h` and combinations such as `1m30s`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            bail!("invalid duration: {s}");
        }
        let value: u64 = rest[..digits].parse()?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let secs_per_unit = match &rest[..unit_len] {
            "ms" => None,
            "s" => Some(1),
            "m" => Some(60),
            "h" => Some(3600),
            _ => bail!("invalid duration: {s}"),
        };
        let unit = match secs_per_unit {
            None => Duration::from_millis(value),
            Some(factor) => match value.checked_mul(factor) {
                Some(secs) => Duration::from_secs(secs),
                None => bail!("duration out of range: {s}"),
            },
        };
        total = match total.checked_add(unit) {
            Some(total) => total,
            None => bail!("duration out of range: {s}"),
        };
        rest = &rest[unit_len..];
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
version: "3.7"
services:
  db:
    image: mariadb:10.1
    container_name: testpool_db
    ports: ["13306:3306"]
    environment: ["MYSQL_ALLOW_EMPTY_PASSWORD=yes"]
    command: ["--character-set-server=utf8"]
    volumes: [".:/docker-entrypoint-initdb.d:ro"]
    Healthcheck:
      test: ["CMD", "mysqladmin", "ping"]
      interval: 1s
      timeout: 2s
      retries: 20
      start_period: 1m30s
    hooks:
      - custom: refresh_mysql
  redis:
    image: redis
    ports: ["16379:6379"]
    hooks:
      - cmd: ["redis-cli", "flushall"]
"#;

    #[test]
    fn parses_services_in_declaration_order() {
        let config = PoolConfig::from_yaml(SAMPLE, "/srv/app").unwrap();
        let specs = config.into_specs("ci").unwrap();

        assert_eq!(specs.len(), 2);

        let db = &specs[0];
        assert_eq!(db.name, "testpool_db");
        assert_eq!(db.image.familiar(), "mariadb:10.1");
        assert_eq!(db.ports[0].host_port, 13306);
        assert_eq!(db.env_value("MYSQL_ALLOW_EMPTY_PASSWORD"), Some("yes"));
        assert_eq!(db.command, vec!["--character-set-server=utf8"]);
        assert_eq!(db.mounts[0].source, PathBuf::from("/srv/app"));
        assert!(db.mounts[0].read_only);
        let health = db.healthcheck.as_ref().unwrap();
        assert_eq!(health.retries, Some(20));
        assert_eq!(health.start_period, Some(Duration::from_secs(90)));
        assert_eq!(
            db.hooks,
            vec![Hook::Custom {
                name: "refresh_mysql".to_string()
            }]
        );

        let redis = &specs[1];
        assert_eq!(redis.name, "ci_redis");
        assert_eq!(redis.image.canonical(), "docker.io/library/redis:latest");
        assert!(redis.healthcheck.is_none());
        assert_eq!(
            redis.hooks,
            vec![Hook::Exec {
                command: vec!["redis-cli".to_string(), "flushall".to_string()]
            }]
        );
    }

    #[test]
    fn rejects_missing_image() {
        let yaml = "services:\n  pg:\n    ports: [\"5432:5432\"]\n";
        assert!(PoolConfig::from_yaml(yaml, "/").is_err());
    }

    #[test]
    fn rejects_empty_image() {
        let yaml = "services:\n  pg:\n    image: \"  \"\n";
        let config = PoolConfig::from_yaml(yaml, "/").unwrap();
        assert!(config.into_specs("ci").is_err());
    }

    #[test]
    fn validates_service_name() {
        assert!(validate_service_name("db").is_ok());
        assert!(validate_service_name("db-1.replica_a").is_ok());
        assert!(validate_service_name("").is_err());
        assert!(validate_service_name("_db").is_err());
        assert!(validate_service_name("db/1").is_err());
    }

    #[test]
    fn rejects_hook_with_both_kinds() {
        let yaml = r#"
services:
  cache:
    image: redis
    hooks:
      - cmd: ["redis-cli", "flushall"]
        custom: refresh_mysql
"#;
        let config = PoolConfig::from_yaml(yaml, "/").unwrap();
        let err = config.into_specs("ci").unwrap_err();
        assert!(format!("{err:#}").contains("exactly one"));
    }

    #[test]
    fn rejects_malformed_port() {
        let yaml = "services:\n  cache:\n    image: redis\n    ports: [\"abc\"]\n";
        let config = PoolConfig::from_yaml(yaml, "/").unwrap();
        assert!(config.into_specs("ci").is_err());
    }

    #[test]
    fn shell_form_command_and_healthcheck() {
        let yaml = r#"
services:
  pg:
    image: postgres:15
    command: postgres -c fsync=off
    healthcheck:
      test: pg_isready -U postgres
      interval: 500ms
"#;
        let config = PoolConfig::from_yaml(yaml, "/").unwrap();
        let spec = config.into_specs("ci").unwrap().remove(0);

        assert_eq!(spec.command, vec!["postgres", "-c", "fsync=off"]);
        let health = spec.healthcheck.unwrap();
        assert_eq!(health.test, vec!["CMD-SHELL", "pg_isready -U postgres"]);
        assert_eq!(health.interval, Some(Duration::from_millis(500)));
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("3d").is_err());
    }

    #[test]
    fn rejects_durations_that_overflow() {
        let err = parse_duration(&format!("{}h", u64::MAX)).unwrap_err();
        assert!(err.to_string().contains("out of range"));

        let err = parse_duration(&format!("{}s{}s", u64::MAX, u64::MAX)).unwrap_err();
        assert!(err.to_string().contains("out of range"));

        assert_eq!(
            parse_duration(&format!("{}s", u64::MAX)).unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn resolves_relative_volumes_against_config_dir() {
        let base = Path::new("/srv/app");

        let mount = resolve_mount("./sql:/docker-entrypoint-initdb.d", base).unwrap();
        assert_eq!(mount.source, PathBuf::from("/srv/app/sql"));

        let mount = resolve_mount("/var/lib/data:/data:rw", base).unwrap();
        assert_eq!(mount.source, PathBuf::from("/var/lib/data"));
        assert!(!mount.read_only);
    }

    #[test]
    fn loads_and_finds_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();

        let path = dir.path().join(DEFAULT_CONFIG_NAME);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let found = find_config(&nested).unwrap();
        assert_eq!(found, path);

        let config = load_config(&found).unwrap();
        assert_eq!(config.base_dir, fs::canonicalize(dir.path()).unwrap());
        assert_eq!(
            config.services.keys().collect::<Vec<_>>(),
            vec!["db", "redis"]
        );
    }
}
