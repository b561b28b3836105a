//! Project configuration.
//!
//! The user authors a single YAML file at the repo root. By convention
//! `apps` hold services with public ingress (deployed blue-green
//! through the edge proxy) and `services` hold project infrastructure
//! (deployed stop-start); what actually selects the blue-green path is
//! the presence of a `proxy` block on the entry. Both sections accept
//! either a map keyed by service name or an array of entries carrying
//! a `name` field.

mod secrets;

pub use secrets::{SECRETS_FILE, Secrets, load_secrets, parse_secrets};

/// The secrets file lives next to the project file.
pub fn secrets_path(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .unwrap_or(Path::new("."))
        .join(SECRETS_FILE)
}

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::ConfigError;
use iop_common::labels::RESERVED_SERVICE_NAMES;

pub const DEFAULT_CONFIG_FILE: &str = "iop.yml";
pub const DEFAULT_PROXY_IMAGE: &str = "elitan/iop-proxy:latest";
pub const DEFAULT_HEALTH_PATH: &str = "/up";

/// Fully validated project configuration.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub name: String,
    pub ssh: SshConfig,
    pub docker: Option<RegistryConfig>,
    pub proxy_image: String,
    /// All services, apps and infrastructure alike, keyed by name.
    pub services: BTreeMap<String, Service>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_username")]
    pub username: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            username: default_ssh_username(),
            port: default_ssh_port(),
            key_file: None,
        }
    }
}

fn default_ssh_username() -> String {
    "iop".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

/// Registry credentials for pulling external images on the server. The
/// password is never written to the config file; it is looked up in the
/// secrets file under `password_secret`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub registry: String,
    pub username: String,
    #[serde(default = "default_password_secret")]
    pub password_secret: String,
}

fn default_password_secret() -> String {
    "DOCKER_REGISTRY_PASSWORD".to_string()
}

/// One deployable unit.
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub kind: ServiceKind,
    /// Target server (hostname or address as used for ssh).
    pub server: String,
    pub source: ImageSource,
    pub replicas: u32,
    /// Plain `K=V` environment entries.
    pub env_plain: Vec<String>,
    /// Names of keys resolved from the secrets file.
    pub env_secrets: Vec<String>,
    pub volumes: Vec<String>,
    pub ports: Vec<String>,
    pub command: Option<String>,
}

/// Only the ingress variant can take the zero-downtime path; the
/// compiler keeps stop-start code away from the alias dance.
#[derive(Debug, Clone)]
pub enum ServiceKind {
    Ingress(Ingress),
    Infra,
}

impl Service {
    pub fn ingress(&self) -> Option<&Ingress> {
        match &self.kind {
            ServiceKind::Ingress(ingress) => Some(ingress),
            ServiceKind::Infra => None,
        }
    }

    pub fn is_built(&self) -> bool {
        matches!(self.source, ImageSource::Build(_))
    }
}

#[derive(Debug, Clone)]
pub struct Ingress {
    /// External hostnames served by the edge proxy.
    pub hosts: Vec<String>,
    /// Port the app listens on inside the container.
    pub app_port: u16,
    pub health_path: String,
    pub ssl: bool,
}

#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Pulled from a registry on the server.
    Image(String),
    /// Built locally and shipped over ssh.
    Build(BuildSpec),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BuildSpec {
    pub context: String,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Raw (serde) representation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawProject {
    name: Option<String>,
    #[serde(default)]
    ssh: SshConfig,
    #[serde(default)]
    docker: Option<RegistryConfig>,
    #[serde(default)]
    proxy: Option<RawProxySection>,
    #[serde(default)]
    apps: Option<RawServices>,
    #[serde(default)]
    services: Option<RawServices>,
}

#[derive(Debug, Deserialize)]
struct RawProxySection {
    image: Option<String>,
}

/// Map form (`web: {...}`) or array form (`- name: web`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawServices {
    Map(BTreeMap<String, RawService>),
    List(Vec<RawNamedService>),
}

#[derive(Debug, Deserialize)]
struct RawNamedService {
    name: String,
    #[serde(flatten)]
    service: RawService,
}

#[derive(Debug, Deserialize)]
struct RawService {
    server: String,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    build: Option<BuildSpec>,
    #[serde(default)]
    proxy: Option<RawIngress>,
    #[serde(default = "default_replicas")]
    replicas: u32,
    #[serde(default)]
    environment: RawEnvironment,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    ports: Vec<String>,
    #[serde(default)]
    command: Option<String>,
}

fn default_replicas() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct RawIngress {
    #[serde(default)]
    hosts: Vec<String>,
    app_port: u16,
    #[serde(default)]
    health_path: Option<String>,
    #[serde(default)]
    ssl: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnvironment {
    #[serde(default)]
    plain: Vec<String>,
    #[serde(default)]
    secrets: Vec<String>,
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&raw, &path.display().to_string())
    }

    pub fn parse(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        let raw: RawProject = serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;

        let name = raw
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or(ConfigError::EmptyProjectName)?
            .to_string();

        let mut services = BTreeMap::new();
        for (service_name, entry) in flatten(raw.apps)? {
            let service = build_service(&service_name, entry)?;
            services.insert(service_name, service);
        }
        for (service_name, entry) in flatten(raw.services)? {
            if services.contains_key(&service_name) {
                return Err(ConfigError::InvalidService {
                    name: service_name,
                    message: "declared under both apps and services".to_string(),
                });
            }
            let service = build_service(&service_name, entry)?;
            services.insert(service_name, service);
        }

        Ok(Self {
            name,
            ssh: raw.ssh,
            docker: raw.docker,
            proxy_image: raw
                .proxy
                .and_then(|p| p.image)
                .unwrap_or_else(|| DEFAULT_PROXY_IMAGE.to_string()),
            services,
        })
    }

    /// Names of the servers any in-scope service targets, deduplicated.
    pub fn servers<'a>(&'a self, services: &[&'a Service]) -> Vec<&'a str> {
        let mut servers: Vec<&str> = services.iter().map(|s| s.server.as_str()).collect();
        servers.sort_unstable();
        servers.dedup();
        servers
    }

    /// Verify that every referenced secret key exists.
    pub fn check_secrets(&self, secrets: &Secrets) -> Result<(), ConfigError> {
        for service in self.services.values() {
            for key in &service.env_secrets {
                if !secrets.contains_key(key) {
                    return Err(ConfigError::MissingSecret {
                        service: service.name.clone(),
                        key: key.clone(),
                    });
                }
            }
        }
        if let Some(docker) = &self.docker {
            let external = self
                .services
                .values()
                .any(|s| matches!(s.source, ImageSource::Image(_)));
            if external && !secrets.contains_key(&docker.password_secret) {
                return Err(ConfigError::MissingSecret {
                    service: "docker".to_string(),
                    key: docker.password_secret.clone(),
                });
            }
        }
        Ok(())
    }
}

fn flatten(
    section: Option<RawServices>,
) -> Result<Vec<(String, RawService)>, ConfigError> {
    Ok(match section {
        None => Vec::new(),
        Some(RawServices::Map(map)) => map.into_iter().collect(),
        Some(RawServices::List(list)) => list
            .into_iter()
            .map(|named| (named.name, named.service))
            .collect(),
    })
}

fn build_service(name: &str, raw: RawService) -> Result<Service, ConfigError> {
    if RESERVED_SERVICE_NAMES.contains(&name) {
        return Err(ConfigError::ReservedName(name.to_string()));
    }
    let invalid = |message: &str| ConfigError::InvalidService {
        name: name.to_string(),
        message: message.to_string(),
    };

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(invalid("service names are [a-z0-9-]"));
    }

    let source = match (raw.image, raw.build) {
        (Some(image), None) => ImageSource::Image(image),
        (None, Some(build)) => ImageSource::Build(build),
        (Some(_), Some(_)) => return Err(invalid("specify image or build, not both")),
        (None, None) => return Err(invalid("one of image or build is required")),
    };

    if raw.replicas == 0 {
        return Err(invalid("replicas must be at least 1"));
    }

    // A proxy block makes a service an ingress service, whichever
    // section it was declared in; `apps` vs `services` is convention.
    let kind = match raw.proxy {
        Some(ingress) => {
            if ingress.hosts.is_empty() {
                return Err(invalid("proxy block requires at least one host"));
            }
            ServiceKind::Ingress(Ingress {
                hosts: ingress
                    .hosts
                    .into_iter()
                    .map(|h| h.trim().to_ascii_lowercase())
                    .collect(),
                app_port: ingress.app_port,
                health_path: ingress
                    .health_path
                    .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string()),
                ssl: ingress.ssl.unwrap_or(true),
            })
        }
        None => ServiceKind::Infra,
    };

    for entry in &raw.environment.plain {
        if !entry.contains('=') {
            return Err(invalid("environment.plain entries must be K=V"));
        }
    }

    Ok(Service {
        name: name.to_string(),
        kind,
        server: raw.server,
        source,
        replicas: raw.replicas,
        env_plain: raw.environment.plain,
        env_secrets: raw.environment.secrets,
        volumes: raw.volumes,
        ports: raw.ports,
        command: raw.command,
    })
}
