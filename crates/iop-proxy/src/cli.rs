//! Embedded ops commands.
//!
//! Convenience subcommands for poking a running proxy from inside its
//! container (`docker exec iop-proxy iop-proxy status`). They are thin
//! HTTP clients for the admin API; the orchestrator never shells out to
//! them for control flow.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use iop_common::api::{
    ApiResponse, CertRenewRequest, RouteSummary, StagingRequest, StatusResponse,
};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

fn client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(CLIENT_TIMEOUT)
        .build()
        .context("building http client")
}

fn api(admin_addr: SocketAddr, path: &str) -> String {
    format!("http://{admin_addr}{path}")
}

/// `iop-proxy status`: staging flag plus one line per route.
pub async fn status(admin_addr: SocketAddr) -> Result<()> {
    let response: ApiResponse<StatusResponse> = client()?
        .get(api(admin_addr, "/api/status"))
        .send()
        .await
        .context("admin api unreachable; is the proxy running?")?
        .json()
        .await
        .context("decoding status response")?;
    let status = response.into_result().map_err(anyhow::Error::msg)?;

    println!(
        "staging: {}",
        if status.staging { "on" } else { "off" }
    );
    if status.routes.is_empty() {
        println!("no routes configured");
        return Ok(());
    }
    for route in status.routes {
        let cert = route
            .cert
            .map(|c| format!("{:?}", c.state).to_lowercase())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} -> {:<30} health={:<9} ssl={} cert={}",
            route.host,
            route.target,
            format!("{:?}", route.health).to_lowercase(),
            route.ssl,
            cert
        );
    }
    Ok(())
}

/// `iop-proxy routes`: just the route table, one line per host.
pub async fn routes(admin_addr: SocketAddr) -> Result<()> {
    let response: ApiResponse<Vec<RouteSummary>> = client()?
        .get(api(admin_addr, "/api/hosts"))
        .send()
        .await
        .context("admin api unreachable; is the proxy running?")?
        .json()
        .await
        .context("decoding routes response")?;
    let routes = response.into_result().map_err(anyhow::Error::msg)?;
    if routes.is_empty() {
        println!("no routes configured");
    }
    for route in routes {
        println!("{} -> {}", route.host, route.target);
    }
    Ok(())
}

/// `iop-proxy cert-renew <host>`: reset back-off and reissue.
pub async fn cert_renew(admin_addr: SocketAddr, host: &str) -> Result<()> {
    let response: ApiResponse<serde_json::Value> = client()?
        .post(api(admin_addr, "/api/cert/renew"))
        .json(&CertRenewRequest {
            host: host.to_string(),
        })
        .send()
        .await
        .context("admin api unreachable")?
        .json()
        .await
        .context("decoding response")?;
    response.ok().map_err(anyhow::Error::msg)?;
    println!("renewal queued for {host}");
    Ok(())
}

/// `iop-proxy staging <on|off>`.
pub async fn staging(admin_addr: SocketAddr, enable: bool) -> Result<()> {
    let response: ApiResponse<serde_json::Value> = client()?
        .post(api(admin_addr, "/api/staging"))
        .json(&StagingRequest { staging: enable })
        .send()
        .await
        .context("admin api unreachable")?
        .json()
        .await
        .context("decoding response")?;
    response.ok().map_err(anyhow::Error::msg)?;
    println!("staging {}", if enable { "enabled" } else { "disabled" });
    Ok(())
}

/// `iop-proxy probe <url>`: one HTTP GET from inside the project
/// network. The orchestrator's health gate runs this through
/// `docker exec`, which is what lets it probe temp-aliased replicas
/// that carry no live traffic yet.
pub async fn probe(url: &str, timeout_secs: u64) -> Result<()> {
    let response = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("building http client")?
        .get(url)
        .send()
        .await
        .with_context(|| format!("probe request to {url} failed"))?;

    let status = response.status();
    println!("{}", status.as_u16());
    if status != reqwest::StatusCode::OK {
        bail!("probe returned {status}");
    }
    Ok(())
}
