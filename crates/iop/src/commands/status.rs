//! The `iop status` view.
//!
//! Live state per server: the project's containers as docker reports
//! them, and the edge proxy's routes with health and certificate
//! states. Read-only; never mutates anything on the server.

use std::path::Path;

use anyhow::Result;
use tracing::warn;

use crate::config::ProjectConfig;
use crate::docker::RemoteDocker;
use crate::proxy_client::ProxyClient;
use crate::ssh::SshSession;
use iop_common::labels;

pub async fn run(config_path: &Path) -> Result<()> {
    let config = ProjectConfig::load(config_path)?;
    let services: Vec<_> = config.services.values().collect();
    let servers = config.servers(&services);

    println!("project: {}", config.name);
    for server in servers {
        println!("\nserver {server}:");
        if let Err(e) = show_server(&config, server).await {
            warn!("[CLI] [{server}] status unavailable: {e}");
            println!("  (unreachable: {e})");
        }
    }
    Ok(())
}

async fn show_server(config: &ProjectConfig, server: &str) -> Result<()> {
    let ssh = SshSession::connect(&config.ssh, server).await?;
    let docker = RemoteDocker::new(&ssh);

    let containers = docker
        .containers_by_label(&[(labels::PROJECT, config.name.as_str())])
        .await?;
    if containers.is_empty() {
        println!("  no containers");
    }
    for details in &containers {
        let color = details
            .label(labels::COLOR)
            .map(|c| format!(" color={c}"))
            .unwrap_or_default();
        println!(
            "  {:<32} {:<10}{color} image={}",
            details.short_name(),
            details.state.status,
            details.config.image
        );
    }

    let proxy = ProxyClient::new(&ssh);
    match proxy.status().await {
        Ok(status) => {
            for route in status
                .routes
                .iter()
                .filter(|route| route.project == config.name)
            {
                let cert = route
                    .cert
                    .as_ref()
                    .map(|c| format!("{:?}", c.state).to_lowercase())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  route {:<32} -> {:<24} health={:<9} cert={cert}",
                    route.host,
                    route.target,
                    format!("{:?}", route.health).to_lowercase()
                );
            }
        }
        Err(e) => println!("  proxy status unavailable: {e}"),
    }

    ssh.close().await.ok();
    Ok(())
}
