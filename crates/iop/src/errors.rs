//! Error types for the orchestrator.
//!
//! The taxonomy mirrors the failure domains of a run: configuration
//! errors are fatal before any side effect, preflight errors stop the
//! whole run, and everything downstream aborts only the service it
//! belongs to.

use thiserror::Error;

/// Problems in the project file or secrets, caught before anything
/// touches a server.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("project file not found at {0}")]
    Missing(String),

    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid yaml in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("project name must not be empty")]
    EmptyProjectName,

    #[error("'{0}' is a reserved service name")]
    ReservedName(String),

    #[error("service '{name}': {message}")]
    InvalidService { name: String, message: String },

    #[error("service '{service}' references secret '{key}' which is not in .iop/secrets")]
    MissingSecret { service: String, key: String },

    #[error("secrets file line {line} is not KEY=VALUE")]
    MalformedSecret { line: usize },
}

/// Server-level gates that must hold before any deployment starts.
/// Fatal for the run, with a remediation hint.
#[derive(Error, Debug)]
pub enum PreflightError {
    #[error("cannot reach {host} over ssh: {message}")]
    SshUnreachable { host: String, message: String },

    #[error("docker is not available on {host}: {message}")]
    DockerMissing { host: String, message: String },

    #[error("could not ensure network '{network}' on {host}: {message}")]
    Network {
        host: String,
        network: String,
        message: String,
    },

    #[error("edge proxy is not running on {host}: {message}")]
    ProxyUnavailable { host: String, message: String },

    #[error("could not prepare project directory on {host}: {message}")]
    ProjectDir { host: String, message: String },

    #[error(
        "host port {port} on {host} is already published by container '{container}' outside this project"
    )]
    PortConflict {
        host: String,
        port: u16,
        container: String,
    },
}

impl PreflightError {
    /// A one-line hint printed next to the error.
    pub fn remediation(&self) -> &'static str {
        match self {
            PreflightError::SshUnreachable { .. } => {
                "check the ssh block in iop.yml and that your key is authorized on the server"
            }
            PreflightError::DockerMissing { .. } => {
                "install docker on the server and add the ssh user to the docker group"
            }
            PreflightError::Network { .. } => "inspect `docker network ls` on the server",
            PreflightError::ProxyUnavailable { .. } => {
                "the proxy container failed to start; check `docker logs iop-proxy` on the server"
            }
            PreflightError::ProjectDir { .. } => {
                "check permissions of ~/.iop on the server"
            }
            PreflightError::PortConflict { .. } => {
                "stop the conflicting container or change the port mapping"
            }
        }
    }
}

/// SSH transport failures.
#[derive(Error, Debug)]
pub enum SshError {
    #[error("connect to {host} failed: {source}")]
    Connect {
        host: String,
        #[source]
        source: openssh::Error,
    },

    #[error("remote command failed to start on {host}: {source}")]
    Spawn {
        host: String,
        #[source]
        source: openssh::Error,
    },

    #[error("`{command}` on {host} exited with {code:?}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("upload to {host}:{path} failed: {message}")]
    Upload {
        host: String,
        path: String,
        message: String,
    },
}

/// Container engine failures, local or remote.
#[derive(Error, Debug)]
pub enum DockerError {
    #[error("docker binary not found locally; is docker installed?")]
    BinaryMissing,

    #[error("`docker {command}` failed: {stderr}")]
    Local { command: String, stderr: String },

    #[error("remote docker: {0}")]
    Remote(#[from] SshError),

    #[error("unexpected docker output for `{command}`: {message}")]
    BadOutput { command: String, message: String },
}

/// Image save/compress/upload/load failures. Aborts one service.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("saving image {image}: {message}")]
    Save { image: String, message: String },

    #[error("compressing image archive: {0}")]
    Compress(String),

    #[error("uploading archive: {0}")]
    Upload(#[from] SshError),

    #[error("loading image on the server: {0}")]
    Load(#[from] DockerError),

    #[error("archive io: {0}")]
    Io(#[from] std::io::Error),
}

/// Admin API failures as seen from the orchestrator.
#[derive(Error, Debug)]
pub enum ProxyApiError {
    #[error("admin api transport: {0}")]
    Transport(#[from] DockerError),

    #[error("admin api returned an unparseable response: {0}")]
    BadResponse(String),

    #[error("admin api rejected the request: {0}")]
    Rejected(String),
}

/// Per-service deployment failures. The service is rolled back; the run
/// continues with the remaining services.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    ProxyApi(#[from] ProxyApiError),

    #[error("health gate failed: {0}")]
    HealthGate(String),

    #[error("alias switch failed for {container}: {message}")]
    AliasSwitch { container: String, message: String },

    #[error("drain of {container} failed: {message}")]
    Drain { container: String, message: String },
}

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
