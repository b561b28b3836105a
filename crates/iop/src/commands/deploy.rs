//! The `iop deploy` run.
//!
//! Servers are handled concurrently; services on one server strictly
//! in sequence so the log reads top to bottom and rollback never
//! interleaves. Each service is its own failure domain: one broken
//! health gate does not stop the others, but it does flip the exit
//! code.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{error, info, warn};

use crate::config::{
    ImageSource, ProjectConfig, Secrets, Service, ServiceKind, load_secrets, secrets_path,
};
use crate::deploy::reconcile::{Decision, decide};
use crate::deploy::{DeployTarget, ServerEnv, blue_green, preflight, stop_start, transfer};
use crate::docker::{ContainerDetails, LocalDocker, RemoteDocker};
use crate::fingerprint::{self, Fingerprint};
use crate::proxy_client::ProxyClient;
use crate::release::Release;
use crate::ssh::SshSession;
use iop_common::labels::{self, names};

pub struct DeployArgs {
    pub config_path: std::path::PathBuf,
    /// Restrict the run to these services; empty means everything.
    pub services: Vec<String>,
}

#[derive(Debug)]
pub struct ServiceReport {
    pub service: String,
    pub server: String,
    pub outcome: Outcome,
}

#[derive(Debug)]
pub enum Outcome {
    Deployed { reason: String },
    Skipped,
    Failed { error: String },
}

/// Returns whether every service succeeded. Configuration and
/// preflight problems are fatal and surface as `Err`.
pub async fn run(args: DeployArgs) -> Result<bool> {
    let config = ProjectConfig::load(&args.config_path)?;
    let secrets = load_secrets(&secrets_path(&args.config_path))?;
    config.check_secrets(&secrets)?;

    let in_scope = select_services(&config, &args.services)?;
    if in_scope.is_empty() {
        bail!("no services to deploy; check the project file");
    }
    let full_run = args.services.is_empty();

    let release = Release::derive().await;
    info!("[CLI] release {release} for project {}", config.name);

    // Build everything up front; fingerprints of built services need
    // the image digest.
    let built_images = build_images(&config, &release, &in_scope).await?;

    let mut by_server: BTreeMap<&str, Vec<&Service>> = BTreeMap::new();
    for &service in &in_scope {
        by_server.entry(service.server.as_str()).or_default().push(service);
    }

    let runs = by_server.iter().map(|(server, services)| {
        deploy_server(&config, &secrets, &built_images, server, services, full_run)
    });
    let mut reports = Vec::new();
    for result in futures::future::join_all(runs).await {
        reports.extend(result?);
    }

    Ok(summarize(&reports))
}

fn select_services<'a>(
    config: &'a ProjectConfig,
    requested: &[String],
) -> Result<Vec<&'a Service>> {
    if requested.is_empty() {
        return Ok(config.services.values().collect());
    }
    let mut selected = Vec::new();
    for name in requested {
        let service = config
            .services
            .get(name)
            .with_context(|| format!("service '{name}' is not in the project file"))?;
        selected.push(service);
    }
    Ok(selected)
}

/// `docker build` every in-scope built service and record its tag and
/// content digest.
async fn build_images(
    config: &ProjectConfig,
    release: &Release,
    services: &[&Service],
) -> Result<BTreeMap<String, BuiltImage>> {
    let mut built = BTreeMap::new();
    let needs_build = services.iter().any(|s| s.is_built());
    if !needs_build {
        return Ok(built);
    }

    let docker = LocalDocker::ensure_available()?;
    for service in services {
        let ImageSource::Build(spec) = &service.source else {
            continue;
        };
        let tag = release.image_tag(&config.name, &service.name);
        docker.build(&tag, spec).await?;
        let digest = docker
            .image_digest(&tag)
            .await?
            .with_context(|| format!("built image {tag} has no digest"))?;
        info!("[CLI] built {tag} ({digest})");
        built.insert(service.name.clone(), BuiltImage { tag, digest });
    }
    Ok(built)
}

struct BuiltImage {
    tag: String,
    digest: String,
}

async fn deploy_server(
    config: &ProjectConfig,
    secrets: &Secrets,
    built_images: &BTreeMap<String, BuiltImage>,
    server: &str,
    services: &[&Service],
    full_run: bool,
) -> Result<Vec<ServiceReport>> {
    let ssh = SshSession::connect(&config.ssh, server).await.map_err(|e| {
        let preflight = crate::errors::PreflightError::SshUnreachable {
            host: server.to_string(),
            message: e.to_string(),
        };
        anyhow::anyhow!("{preflight}\n  hint: {}", preflight.remediation())
    })?;

    let env = preflight::run(&ssh, config, services)
        .await
        .map_err(|e| anyhow::anyhow!("{e}\n  hint: {}", e.remediation()))?;

    let mut reports = Vec::new();
    let mut logged_in = false;
    for service in services {
        let outcome = deploy_service(
            &ssh,
            config,
            secrets,
            built_images,
            service,
            &env,
            &mut logged_in,
        )
        .await;
        if let Outcome::Failed { error } = &outcome {
            error!("[CLI] [{server}] {}: {error}", service.name);
        }
        reports.push(ServiceReport {
            service: service.name.clone(),
            server: server.to_string(),
            outcome,
        });
    }

    if full_run {
        if let Err(e) = collect_orphans(&ssh, config).await {
            warn!("[CLI] [{server}] orphan cleanup incomplete: {e}");
        }
    }

    if let Err(e) = ssh.close().await {
        warn!("[CLI] [{server}] closing ssh session: {e}");
    }
    Ok(reports)
}

async fn deploy_service(
    ssh: &SshSession,
    config: &ProjectConfig,
    secrets: &Secrets,
    built_images: &BTreeMap<String, BuiltImage>,
    service: &Service,
    env: &ServerEnv,
    logged_in: &mut bool,
) -> Outcome {
    let server = ssh.host();
    let docker = RemoteDocker::new(ssh);

    let current = match current_container(&docker, config, service).await {
        Ok(current) => current,
        Err(e) => return Outcome::Failed { error: e.to_string() },
    };

    let (image, desired) = match &service.source {
        ImageSource::Build(_) => {
            let Some(built) = built_images.get(&service.name) else {
                return Outcome::Failed {
                    error: "image was not built this run".to_string(),
                };
            };
            let fingerprint = Fingerprint::Built {
                config_hash: fingerprint::config_hash(service),
                secrets_hash: fingerprint::secrets_hash(service, secrets),
                local_image_hash: built.digest.clone(),
                server_image_hash: current
                    .as_ref()
                    .and_then(|c| c.label(labels::SERVER_IMAGE_HASH))
                    .map(str::to_string),
            };
            (built.tag.clone(), fingerprint)
        }
        ImageSource::Image(reference) => (
            reference.clone(),
            Fingerprint::External {
                config_hash: fingerprint::config_hash(service),
                secrets_hash: fingerprint::secrets_hash(service, secrets),
                image_reference: reference.clone(),
            },
        ),
    };

    let decision = decide(&desired, current.as_ref());
    match decision {
        Decision::Skip => {
            info!("[CLI] [{server}] {}: skipped (up-to-date)", service.name);
            return Outcome::Skipped;
        }
        Decision::Deploy(reason) => {
            info!("[CLI] [{server}] {}: deploying ({reason})", service.name);
        }
    }

    // Make the image available on the server.
    let staged = match &service.source {
        ImageSource::Build(_) => match built_images.get(&service.name) {
            Some(built) => stage_built_image(ssh, &docker, built).await,
            None => Err("image was not built this run".to_string()),
        },
        ImageSource::Image(reference) => {
            stage_external_image(config, secrets, &docker, reference, logged_in).await
        }
    };
    if let Err(error) = staged {
        return Outcome::Failed { error };
    }

    let target = DeployTarget {
        config,
        service,
        image,
        fingerprint: &desired,
        secrets,
        env,
    };
    let result = match &service.kind {
        ServiceKind::Ingress(ingress) => blue_green::deploy(ssh, &target, ingress).await,
        ServiceKind::Infra => stop_start::deploy(ssh, &target).await,
    };
    match result {
        Ok(()) => Outcome::Deployed {
            reason: decision.reason_str(),
        },
        Err(e) => Outcome::Failed { error: e.to_string() },
    }
}

/// Ship a built image unless the server already holds the exact bits.
async fn stage_built_image(
    ssh: &SshSession,
    docker: &RemoteDocker<'_>,
    built: &BuiltImage,
) -> Result<(), String> {
    match docker.image_digest(&built.digest).await {
        Ok(Some(_)) => {
            // Same content already on the server; just give it the tag.
            docker
                .tag(&built.digest, &built.tag)
                .await
                .map_err(|e| e.to_string())?;
            Ok(())
        }
        Ok(None) => {
            let local = LocalDocker::ensure_available().map_err(|e| e.to_string())?;
            transfer::transfer_image(ssh, &local, &built.tag)
                .await
                .map_err(|e| e.to_string())
        }
        Err(e) => Err(e.to_string()),
    }
}

async fn stage_external_image(
    config: &ProjectConfig,
    secrets: &Secrets,
    docker: &RemoteDocker<'_>,
    reference: &str,
    logged_in: &mut bool,
) -> Result<(), String> {
    if let Some(registry) = &config.docker {
        if !*logged_in {
            if let Some(password) = secrets.get(&registry.password_secret) {
                docker
                    .login(&registry.registry, &registry.username, password)
                    .await
                    .map_err(|e| e.to_string())?;
                *logged_in = true;
            }
        }
    }
    docker.pull(reference).await.map_err(|e| e.to_string())
}

/// The container whose labels the reconciler compares against.
async fn current_container(
    docker: &RemoteDocker<'_>,
    config: &ProjectConfig,
    service: &Service,
) -> Result<Option<ContainerDetails>, crate::errors::DockerError> {
    match &service.kind {
        ServiceKind::Infra => {
            docker
                .inspect_named(&names::service_container(&config.name, &service.name))
                .await
        }
        ServiceKind::Ingress(_) => {
            let candidates = docker
                .containers_by_label(&[
                    (labels::PROJECT, config.name.as_str()),
                    (labels::APP, service.name.as_str()),
                ])
                .await?;
            let network = names::project_network(&config.name);
            let primary = names::service_alias(&service.name);
            let best = candidates
                .iter()
                .find(|c| c.aliases_on(&network).contains(&primary))
                .or_else(|| candidates.iter().find(|c| c.state.running))
                .or(candidates.first())
                .cloned();
            Ok(best)
        }
    }
}

/// Remove containers, routes, and certificates for services that have
/// disappeared from the project file.
async fn collect_orphans(ssh: &SshSession, config: &ProjectConfig) -> Result<()> {
    let server = ssh.host();
    let docker = RemoteDocker::new(ssh);

    let owned = docker
        .containers_by_label(&[(labels::PROJECT, config.name.as_str())])
        .await?;
    let mut doomed: Vec<String> = Vec::new();
    for details in &owned {
        let service_name = details
            .label(labels::APP)
            .or_else(|| details.label(labels::SERVICE));
        let Some(service_name) = service_name else {
            continue; // the proxy container and other non-service containers
        };
        if !config.services.contains_key(service_name) {
            doomed.push(details.short_name().to_string());
        }
    }
    if !doomed.is_empty() {
        info!("[CLI] [{server}] removing orphaned containers {doomed:?}");
        docker.stop(&doomed, crate::deploy::DRAIN_TIMEOUT_SECS).await.ok();
        docker.remove(&doomed, true).await?;
    }

    // Routes whose host no longer appears in any ingress block go too;
    // the proxy deletes the certificate material with the route.
    let desired_hosts: Vec<&str> = config
        .services
        .values()
        .filter_map(|service| service.ingress())
        .flat_map(|ingress| ingress.hosts.iter().map(String::as_str))
        .collect();

    let proxy = ProxyClient::new(ssh);
    let status = proxy.status().await?;
    for route in status.routes {
        if route.project == config.name && !desired_hosts.contains(&route.host.as_str()) {
            info!("[CLI] [{server}] removing orphaned route {}", route.host);
            proxy.remove_route(&route.host).await?;
        }
    }
    Ok(())
}

fn summarize(reports: &[ServiceReport]) -> bool {
    let mut all_ok = true;
    println!();
    for report in reports {
        let line = match &report.outcome {
            Outcome::Deployed { reason } => format!("deployed ({reason})"),
            Outcome::Skipped => "skipped (up-to-date)".to_string(),
            Outcome::Failed { error } => {
                all_ok = false;
                format!("FAILED: {error}")
            }
        };
        println!("  {:<20} {:<20} {line}", report.service, report.server);
    }
    println!();
    if all_ok {
        info!("[CLI] deploy complete");
    } else {
        error!("[CLI] deploy finished with failures");
    }
    all_ok
}
