//! The `iop proxy` ops commands.
//!
//! Operational access to the edge proxy on every server of the
//! project: inspect it, pull a newer image and recreate it, or tail
//! its logs. This is why `proxy` is a reserved service name.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::ProjectConfig;
use crate::deploy::preflight;
use crate::docker::RemoteDocker;
use crate::proxy_client::ProxyClient;
use crate::ssh::SshSession;
use iop_common::labels::PROXY_CONTAINER;

pub enum ProxyAction {
    /// Container state plus the admin API's own view.
    Status,
    /// Pull the configured proxy image and recreate the container.
    /// Public traffic is down for the restart window; certificates and
    /// routes survive in `/var/lib/iop-proxy`.
    Update,
    /// Tail the proxy container's logs.
    Logs { tail: u32 },
}

pub async fn run(config_path: &Path, action: ProxyAction) -> Result<()> {
    let config = ProjectConfig::load(config_path)?;
    let services: Vec<_> = config.services.values().collect();

    for server in config.servers(&services) {
        println!("server {server}:");
        let ssh = SshSession::connect(&config.ssh, server)
            .await
            .with_context(|| format!("connecting to {server}"))?;
        match &action {
            ProxyAction::Status => show_status(&ssh).await?,
            ProxyAction::Update => update(&ssh, &config).await?,
            ProxyAction::Logs { tail } => {
                let docker = RemoteDocker::new(&ssh);
                let logs = docker.logs(PROXY_CONTAINER, *tail).await?;
                print!("{logs}");
            }
        }
        ssh.close().await.ok();
    }
    Ok(())
}

async fn show_status(ssh: &SshSession) -> Result<()> {
    let docker = RemoteDocker::new(ssh);
    match docker.inspect_named(PROXY_CONTAINER).await? {
        Some(details) => {
            println!(
                "  container {:<12} image={}",
                details.state.status, details.config.image
            );
        }
        None => {
            println!("  proxy container not present (deploy will create it)");
            return Ok(());
        }
    }

    let proxy = ProxyClient::new(ssh);
    let status = proxy.status().await?;
    println!(
        "  staging={} routes={}",
        if status.staging { "on" } else { "off" },
        status.routes.len()
    );
    for route in status.routes {
        let cert = route
            .cert
            .map(|c| format!("{:?}", c.state).to_lowercase())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<36} -> {:<26} health={:<9} cert={cert}",
            route.host,
            route.target,
            format!("{:?}", route.health).to_lowercase()
        );
    }
    Ok(())
}

async fn update(ssh: &SshSession, config: &ProjectConfig) -> Result<()> {
    let host = ssh.host().to_string();
    let docker = RemoteDocker::new(ssh);

    info!("[CLI] [{host}] pulling {}", config.proxy_image);
    docker.pull(&config.proxy_image).await?;

    if docker.inspect_named(PROXY_CONTAINER).await?.is_some() {
        info!("[CLI] [{host}] recreating {PROXY_CONTAINER}");
        docker.stop(&[PROXY_CONTAINER.to_string()], 30).await.ok();
        docker.remove(&[PROXY_CONTAINER.to_string()], true).await?;
    }

    preflight::ensure_proxy(&docker, &host, config)
        .await
        .map_err(|e| anyhow::anyhow!("{e}\n  hint: {}", e.remediation()))?;
    println!("  proxy updated to {}", config.proxy_image);
    Ok(())
}
