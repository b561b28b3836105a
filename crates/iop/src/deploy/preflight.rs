//! Server preflight.
//!
//! Everything that must hold on a server before any service is
//! touched: docker present, project network and directories in place,
//! the edge proxy running and attached, and no host-port collisions
//! with containers outside the project. Failures here stop the whole
//! run; nothing has been mutated beyond idempotent ensure-steps.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::config::{ProjectConfig, Service};
use crate::docker::{ContainerSpec, RemoteDocker};
use crate::errors::PreflightError;
use crate::ssh::SshSession;
use iop_common::labels::{self, names};

/// Facts about the server gathered during preflight and reused by the
/// deploy steps.
#[derive(Debug, Clone)]
pub struct ServerEnv {
    /// Remote home directory of the ssh user.
    pub home: String,
    /// Absolute project directory, `{home}/.iop/projects/{name}`.
    pub project_dir: String,
}

pub async fn run(
    ssh: &SshSession,
    config: &ProjectConfig,
    services: &[&Service],
) -> Result<ServerEnv, PreflightError> {
    let host = ssh.host().to_string();
    let docker = RemoteDocker::new(ssh);

    let version = docker
        .version()
        .await
        .map_err(|e| PreflightError::DockerMissing {
            host: host.clone(),
            message: e.to_string(),
        })?;
    info!("[CLI] [{host}] docker {version} available");

    let home = docker
        .home_dir()
        .await
        .map_err(|e| PreflightError::ProjectDir {
            host: host.clone(),
            message: e.to_string(),
        })?;
    let project_dir = format!("{home}/{}", names::project_dir(&config.name));
    docker
        .make_dirs(&project_dir)
        .await
        .map_err(|e| PreflightError::ProjectDir {
            host: host.clone(),
            message: e.to_string(),
        })?;

    ensure_network(&docker, &host, &names::project_network(&config.name)).await?;
    ensure_proxy(&docker, &host, config).await?;
    check_port_conflicts(&docker, &host, &config.name, services).await?;

    Ok(ServerEnv { home, project_dir })
}

async fn ensure_network(
    docker: &RemoteDocker<'_>,
    host: &str,
    network: &str,
) -> Result<(), PreflightError> {
    let network_err = |message: String| PreflightError::Network {
        host: host.to_string(),
        network: network.to_string(),
        message,
    };
    let exists = docker
        .network_exists(network)
        .await
        .map_err(|e| network_err(e.to_string()))?;
    if !exists {
        info!("[CLI] [{host}] creating network {network}");
        docker
            .create_network(network)
            .await
            .map_err(|e| network_err(e.to_string()))?;
    }
    Ok(())
}

/// Make sure the edge proxy container exists, runs, and is attached to
/// the project network so it can reach upstream aliases. Also used by
/// `iop proxy update` to bring the container back after an image bump.
pub async fn ensure_proxy(
    docker: &RemoteDocker<'_>,
    host: &str,
    config: &ProjectConfig,
) -> Result<(), PreflightError> {
    let proxy_err = |message: String| PreflightError::ProxyUnavailable {
        host: host.to_string(),
        message,
    };
    let network = names::project_network(&config.name);

    let existing = docker
        .inspect_named(labels::PROXY_CONTAINER)
        .await
        .map_err(|e| proxy_err(e.to_string()))?;

    match existing {
        None => {
            info!("[CLI] [{host}] starting edge proxy ({})", config.proxy_image);
            let spec = ContainerSpec {
                name: labels::PROXY_CONTAINER.to_string(),
                image: config.proxy_image.clone(),
                labels: BTreeMap::from([(labels::MANAGED.to_string(), "true".to_string())]),
                env: BTreeMap::new(),
                volumes: vec!["/var/lib/iop-proxy:/var/lib/iop-proxy".to_string()],
                ports: vec!["80:80".to_string(), "443:443".to_string()],
                network: None,
                aliases: Vec::new(),
                command: None,
            };
            docker
                .create(&spec)
                .await
                .map_err(|e| proxy_err(e.to_string()))?;
            docker
                .start(labels::PROXY_CONTAINER)
                .await
                .map_err(|e| proxy_err(e.to_string()))?;
        }
        Some(details) if !details.state.running => {
            info!("[CLI] [{host}] edge proxy present but stopped, starting it");
            docker
                .start(labels::PROXY_CONTAINER)
                .await
                .map_err(|e| proxy_err(e.to_string()))?;
        }
        Some(_) => {}
    }

    // Attach to the project network; already-attached is fine.
    let attached = docker
        .inspect_named(labels::PROXY_CONTAINER)
        .await
        .map_err(|e| proxy_err(e.to_string()))?
        .map(|details| details.network_settings.networks.contains_key(&network))
        .unwrap_or(false);
    if !attached {
        docker
            .network_connect(&network, labels::PROXY_CONTAINER, &[])
            .await
            .map_err(|e| proxy_err(e.to_string()))?;
        info!("[CLI] [{host}] edge proxy attached to {network}");
    }
    Ok(())
}

/// Reject the run when a requested host port is already published by a
/// container that does not belong to this project.
async fn check_port_conflicts(
    docker: &RemoteDocker<'_>,
    host: &str,
    project: &str,
    services: &[&Service],
) -> Result<(), PreflightError> {
    let wanted: Vec<u16> = services
        .iter()
        .flat_map(|service| service.ports.iter())
        .filter_map(|mapping| mapping.split(':').next())
        .filter_map(|port| port.parse().ok())
        .collect();
    if wanted.is_empty() {
        return Ok(());
    }

    let ids = match docker.container_ids(&[], false).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!("[CLI] [{host}] could not scan for port conflicts: {e}");
            return Ok(());
        }
    };
    let running = match docker.inspect(&ids).await {
        Ok(details) => details,
        Err(e) => {
            warn!("[CLI] [{host}] could not scan for port conflicts: {e}");
            return Ok(());
        }
    };

    for details in running {
        if details.label(iop_common::labels::PROJECT) == Some(project) {
            continue;
        }
        for port in details.published_ports() {
            if wanted.contains(&port) {
                return Err(PreflightError::PortConflict {
                    host: host.to_string(),
                    port,
                    container: details.short_name().to_string(),
                });
            }
        }
    }
    Ok(())
}
