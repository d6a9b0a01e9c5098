use super::ImageRef;
use anyhow::{Result, bail};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
}

/// Declarative description of one auxiliary container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: ImageRef,
    pub ports: Vec<PortBinding>,
    pub mounts: Vec<BindMount>,
    pub env: Vec<String>,
    pub command: Vec<String>,
    pub healthcheck: Option<HealthCheckSpec>,
    pub hooks: Vec<Hook>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: ImageRef) -> Self {
        Self {
            name: name.into(),
            image,
            ports: Vec::new(),
            mounts: Vec::new(),
            env: Vec::new(),
            command: Vec::new(),
            healthcheck: None,
            hooks: Vec::new(),
        }
    }

    /// Looks up a `KEY=VALUE` entry of the declared environment.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

/// Health probe handed to the runtime as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub test: Vec<String>,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub start_period: Option<Duration>,
}

/// Post-start action attached to a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hook {
    /// Runs a command inside the live container.
    Exec { command: Vec<String> },
    /// Named callback resolved through the hook registry.
    Custom { name: String },
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Exec { command } => write!(f, "cmd {:?}", command),
            Hook::Custom { name } => write!(f, "custom {name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

impl PortBinding {
    /// Key used by the runtime for the exposed port, e.g. `6379/tcp`.
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

impl FromStr for PortBinding {
    type Err = anyhow::Error;

    /// Accepts `host:container[/proto]` or `ip:host:container[/proto]`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let (host_ip, host_port, container) = match parts.as_slice() {
            [host, container] => ("127.0.0.1", *host, *container),
            [ip, host, container] => (*ip, *host, *container),
            _ => bail!("wrong port: {s}"),
        };

        let (container_port, protocol) = match container.split_once('/') {
            Some((port, proto)) => (port, proto),
            None => (container, "tcp"),
        };
        if protocol != "tcp" && protocol != "udp" {
            bail!("wrong port protocol in {s}: {protocol}");
        }

        let parse_port = |value: &str| -> Result<u16> {
            match value.parse::<u16>() {
                Ok(port) if port > 0 => Ok(port),
                _ => bail!("wrong port: {s}"),
            }
        };

        Ok(Self {
            host_ip: host_ip.to_string(),
            host_port: parse_port(host_port)?,
            container_port: parse_port(container_port)?,
            protocol: protocol.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl BindMount {
    /// Parses `hostPath:containerPath[:ro|:rw]`. The host path is kept as
    /// written; resolving it is up to the caller.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let (source, target, read_only) = match parts.as_slice() {
            [source, target] => (*source, *target, false),
            [source, target, "ro"] => (*source, *target, true),
            [source, target, "rw"] => (*source, *target, false),
            _ => bail!("wrong volume: {s}"),
        };

        if source.is_empty() || target.is_empty() {
            bail!("wrong volume: {s}");
        }
        if !target.starts_with('/') {
            bail!("volume target must be absolute: {s}");
        }

        Ok(Self {
            source: PathBuf::from(source),
            target: target.to_string(),
            read_only,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_port_binding_on_loopback() {
        let port: PortBinding = "16379:6379".parse().unwrap();
        assert_eq!(port.host_ip, "127.0.0.1");
        assert_eq!(port.host_port, 16379);
        assert_eq!(port.container_port, 6379);
        assert_eq!(port.container_key(), "6379/tcp");
    }

    #[test]
    fn parses_port_binding_with_ip_and_protocol() {
        let port: PortBinding = "0.0.0.0:5353:53/udp".parse().unwrap();
        assert_eq!(port.host_ip, "0.0.0.0");
        assert_eq!(port.container_key(), "53/udp");
    }

    #[test]
    fn rejects_malformed_ports() {
        assert!("6379".parse::<PortBinding>().is_err());
        assert!("abc:6379".parse::<PortBinding>().is_err());
        assert!("1:2/sctp".parse::<PortBinding>().is_err());
        assert!("0:6379".parse::<PortBinding>().is_err());
    }

    #[test]
    fn parses_bind_mounts() {
        let mount = BindMount::parse("./sql:/docker-entrypoint-initdb.d:ro").unwrap();
        assert_eq!(mount.source, PathBuf::from("./sql"));
        assert_eq!(mount.target, "/docker-entrypoint-initdb.d");
        assert!(mount.read_only);

        assert!(BindMount::parse("/data").is_err());
        assert!(BindMount::parse("/data:relative").is_err());
    }

    #[test]
    fn env_value_reads_key_value_pairs() {
        let mut spec = ContainerSpec::new("db", ImageRef::parse("mariadb:10.1").unwrap());
        spec.env = vec![
            "MYSQL_ROOT_PASSWORD=secret".to_string(),
            "EMPTY=".to_string(),
            "BROKEN".to_string(),
        ];

        assert_eq!(spec.env_value("MYSQL_ROOT_PASSWORD"), Some("secret"));
        assert_eq!(spec.env_value("EMPTY"), Some(""));
        assert_eq!(spec.env_value("BROKEN"), None);
    }
}
