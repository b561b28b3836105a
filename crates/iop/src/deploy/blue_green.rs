//! Zero-downtime replacement of an ingress service.
//!
//! The new color comes up behind temporary network aliases, is probed
//! from inside the edge proxy's network until every replica answers,
//! and only then takes over the primary aliases. The old color keeps
//! serving until the moment its replacement is bound, then drains. A
//! failed health gate removes the new color and leaves the system
//! observably unchanged.

use std::time::Duration;

use tracing::{info, warn};

use super::{DRAIN_TIMEOUT_SECS, DeployTarget};
use crate::config::Ingress;
use crate::docker::{ContainerDetails, ContainerSpec, RemoteDocker};
use crate::errors::DeployError;
use crate::proxy_client::ProxyClient;
use crate::ssh::SshSession;
use iop_common::api::{HealthStatus, UpsertHostRequest};
use iop_common::labels::{self, Color, names};

/// Health gate: up to 30 probes at one-second intervals, per replica.
const PROBE_ATTEMPTS: u32 = 30;
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

pub async fn deploy(
    ssh: &SshSession,
    target: &DeployTarget<'_>,
    ingress: &Ingress,
) -> Result<(), DeployError> {
    let docker = RemoteDocker::new(ssh);
    let host = ssh.host().to_string();
    let project = target.project();
    let service = &target.service.name;
    let network = names::project_network(project);

    let existing = docker
        .containers_by_label(&[(labels::PROJECT, project), (labels::APP, service)])
        .await?;

    let active = detect_active_color(&existing, &network, service);
    let new_color = active.map(Color::opposite).unwrap_or(Color::Blue);
    match active {
        Some(color) => info!(
            "[CLI] [{host}] {service}: active color is {color}, deploying {new_color}"
        ),
        None => info!("[CLI] [{host}] {service}: fresh service, deploying {new_color}"),
    }

    // Leftovers of the target color from an aborted earlier run would
    // collide on names; clear them before creating.
    let stale: Vec<String> = existing
        .iter()
        .filter(|details| details.color() == Some(new_color))
        .map(|details| details.short_name().to_string())
        .collect();
    if !stale.is_empty() {
        warn!("[CLI] [{host}] {service}: removing stale {new_color} containers {stale:?}");
        docker.remove(&stale, true).await?;
    }

    let old_names: Vec<String> = existing
        .iter()
        .filter(|details| details.color() != Some(new_color))
        .map(|details| details.short_name().to_string())
        .collect();

    // Bring up the new color behind temp aliases only.
    let mut created: Vec<String> = Vec::new();
    for replica in 1..=target.service.replicas {
        let spec = replica_spec(target, ingress, new_color, replica, &network);
        let result = async {
            docker.create(&spec).await?;
            docker.start(&spec.name).await
        }
        .await;
        if let Err(e) = result {
            created.push(spec.name.clone());
            remove_best_effort(&docker, &created, &host).await;
            return Err(e.into());
        }
        created.push(spec.name);
    }

    // Health gate; on failure the new color disappears again.
    if let Err(message) = health_gate(&docker, target, ingress, new_color, &host).await {
        remove_best_effort(&docker, &created, &host).await;
        return Err(DeployError::HealthGate(message));
    }

    // Atomic cut-over: rebind each replica to the primary aliases. A
    // request mid-cut-over lands on either color, both of which are
    // healthy.
    let primary_aliases = vec![
        names::service_alias(service),
        names::qualified_alias(project, service),
    ];
    for name in &created {
        let result = async {
            docker.network_disconnect(&network, name).await?;
            docker.network_connect(&network, name, &primary_aliases).await
        }
        .await;
        if let Err(e) = result {
            remove_best_effort(&docker, &created, &host).await;
            return Err(DeployError::AliasSwitch {
                container: name.clone(),
                message: e.to_string(),
            });
        }
    }
    info!("[CLI] [{host}] {service}: traffic switched to {new_color}");

    // Graceful drain of the superseded color. `docker stop` delivers
    // the termination signal and kills whatever outlives the timeout.
    if !old_names.is_empty() {
        if let Err(stop_error) = docker.stop(&old_names, DRAIN_TIMEOUT_SECS).await {
            warn!("[CLI] [{host}] {service}: graceful stop failed: {stop_error}");
            docker
                .remove(&old_names, true)
                .await
                .map_err(|e| DeployError::Drain {
                    container: old_names.join(", "),
                    message: e.to_string(),
                })?;
        } else {
            docker.remove(&old_names, false).await?;
        }
        info!("[CLI] [{host}] {service}: drained {} old container(s)", old_names.len());
    }

    // Register routes last; the upstream alias now resolves to the new
    // color. The explicit health report means the proxy serves without
    // waiting for its own first probe cycle.
    let proxy = ProxyClient::new(ssh);
    let upstream = format!(
        "{}:{}",
        names::qualified_alias(project, service),
        ingress.app_port
    );
    for external_host in &ingress.hosts {
        proxy
            .upsert_route(&UpsertHostRequest {
                host: external_host.clone(),
                target: upstream.clone(),
                project: project.to_string(),
                health_path: ingress.health_path.clone(),
                ssl: ingress.ssl,
                request_timeout_secs: None,
            })
            .await?;
        proxy
            .set_health(external_host, HealthStatus::Healthy)
            .await?;
        info!("[CLI] [{host}] {service}: route {external_host} -> {upstream}");
    }

    Ok(())
}

/// Which color currently owns the primary aliases. Preference order:
/// the `iop.active` create-time label when it is unambiguous, then the
/// actual alias binding, then the first running container.
fn detect_active_color(
    existing: &[ContainerDetails],
    network: &str,
    service: &str,
) -> Option<Color> {
    let mut labelled: Vec<Color> = existing
        .iter()
        .filter(|details| details.label(labels::ACTIVE) == Some("true"))
        .filter_map(ContainerDetails::color)
        .collect();
    labelled.sort_unstable_by_key(|color| color.as_str());
    labelled.dedup();
    if let [color] = labelled[..] {
        return Some(color);
    }

    let primary = names::service_alias(service);
    if let Some(color) = existing
        .iter()
        .find(|details| details.aliases_on(network).contains(&primary))
        .and_then(ContainerDetails::color)
    {
        return Some(color);
    }

    existing
        .iter()
        .find(|details| details.state.running)
        .and_then(ContainerDetails::color)
}

fn replica_spec(
    target: &DeployTarget<'_>,
    _ingress: &Ingress,
    color: Color,
    replica: u32,
    network: &str,
) -> ContainerSpec {
    let project = target.project();
    let service = &target.service.name;
    let qualified_temp = names::qualified_temp_alias(project, service, color);
    ContainerSpec {
        name: names::replica_container(project, service, color, replica),
        image: target.image.clone(),
        labels: target.container_labels(Some(color), replica),
        env: target.resolved_env(),
        volumes: target.resolved_volumes(),
        ports: target.service.ports.clone(),
        network: Some(network.to_string()),
        aliases: vec![
            names::temp_alias(service, color),
            qualified_temp.clone(),
            format!("{qualified_temp}-{replica}"),
        ],
        command: target.service.command.clone(),
    }
}

/// Probe every replica through the proxy container until it answers
/// 200 or its attempts run out. Replicas are probed independently; one
/// flaky replica fails the whole gate.
async fn health_gate(
    docker: &RemoteDocker<'_>,
    target: &DeployTarget<'_>,
    ingress: &Ingress,
    color: Color,
    host: &str,
) -> Result<(), String> {
    let project = target.project();
    let service = &target.service.name;
    let mut failures: Vec<String> = Vec::new();

    for replica in 1..=target.service.replicas {
        let url = format!(
            "http://{}-{replica}:{}{}",
            names::qualified_temp_alias(project, service, color),
            ingress.app_port,
            ingress.health_path
        );

        let mut passed = false;
        let mut last_error = String::new();
        for attempt in 1..=PROBE_ATTEMPTS {
            match docker
                .exec(labels::PROXY_CONTAINER, &["iop-proxy", "probe", &url])
                .await
            {
                Ok(output) if output.success() => {
                    info!(
                        "[CLI] [{host}] {service} replica {replica} healthy after {attempt} attempt(s)"
                    );
                    passed = true;
                    break;
                }
                Ok(output) => {
                    last_error = output.stderr.trim().to_string();
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
        if !passed {
            failures.push(format!(
                "replica {replica} never answered 200 on {url}: {last_error}"
            ));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}

async fn remove_best_effort(docker: &RemoteDocker<'_>, names: &[String], host: &str) {
    if names.is_empty() {
        return;
    }
    if let Err(e) = docker.remove(names, true).await {
        warn!("[CLI] [{host}] rollback cleanup left containers behind: {e}");
    }
}
