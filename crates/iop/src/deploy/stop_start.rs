//! Replacement of infrastructure services.
//!
//! No ingress, no color groups: stop the existing container, remove
//! it, create the replacement under the same fixed name. Downtime is
//! bounded by the drain timeout plus the container's own startup.

use tracing::info;

use super::{DRAIN_TIMEOUT_SECS, DeployTarget};
use crate::docker::{ContainerSpec, RemoteDocker};
use crate::errors::DeployError;
use crate::ssh::SshSession;
use iop_common::labels::names;

pub async fn deploy(ssh: &SshSession, target: &DeployTarget<'_>) -> Result<(), DeployError> {
    let docker = RemoteDocker::new(ssh);
    let host = ssh.host().to_string();
    let project = target.project();
    let service = &target.service.name;
    let container = names::service_container(project, service);
    let network = names::project_network(project);

    if docker.inspect_named(&container).await?.is_some() {
        info!("[CLI] [{host}] {service}: replacing {container}");
        if docker
            .stop(&[container.clone()], DRAIN_TIMEOUT_SECS)
            .await
            .is_err()
        {
            docker
                .remove(&[container.clone()], true)
                .await
                .map_err(|e| DeployError::Drain {
                    container: container.clone(),
                    message: e.to_string(),
                })?;
        } else {
            docker.remove(&[container.clone()], false).await?;
        }
    } else {
        info!("[CLI] [{host}] {service}: creating {container}");
    }

    let spec = ContainerSpec {
        name: container.clone(),
        image: target.image.clone(),
        labels: target.container_labels(None, 1),
        env: target.resolved_env(),
        volumes: target.resolved_volumes(),
        ports: target.service.ports.clone(),
        network: Some(network),
        aliases: vec![
            names::service_alias(service),
            names::qualified_alias(project, service),
        ],
        command: target.service.command.clone(),
    };
    docker.create(&spec).await?;
    docker.start(&container).await?;
    info!("[CLI] [{host}] {service}: {container} started");
    Ok(())
}
