//! Admin API client.
//!
//! The proxy's admin API is bound to loopback inside its container, so
//! the orchestrator reaches it by running `curl` in that container over
//! ssh. The payloads are the typed DTOs shared with the proxy; this is
//! the only channel the orchestrator uses to control routing.

use serde::de::DeserializeOwned;

use crate::docker::RemoteDocker;
use crate::errors::ProxyApiError;
use crate::ssh::SshSession;
use iop_common::api::{
    ApiResponse, CertRenewRequest, HealthStatus, RouteSummary, SetHealthRequest, StatusResponse,
    UpsertHostRequest,
};
use iop_common::labels::PROXY_CONTAINER;

const ADMIN_BASE: &str = "http://127.0.0.1:8080";

pub struct ProxyClient<'a> {
    ssh: &'a SshSession,
}

impl<'a> ProxyClient<'a> {
    pub fn new(ssh: &'a SshSession) -> Self {
        Self { ssh }
    }

    pub async fn upsert_route(
        &self,
        request: &UpsertHostRequest,
    ) -> Result<RouteSummary, ProxyApiError> {
        let body = serde_json::to_string(request)
            .map_err(|e| ProxyApiError::BadResponse(e.to_string()))?;
        self.call("POST", "/api/hosts", Some(&body)).await
    }

    /// Remove a route; a host the proxy never knew is not an error
    /// here, because orphan GC may retry after a partial failure.
    pub async fn remove_route(&self, host: &str) -> Result<(), ProxyApiError> {
        match self.call_unit("DELETE", &format!("/api/hosts/{host}"), None).await {
            Ok(()) => Ok(()),
            Err(ProxyApiError::Rejected(message)) if message.contains("unknown host") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn set_health(
        &self,
        host: &str,
        status: HealthStatus,
    ) -> Result<(), ProxyApiError> {
        let body = serde_json::to_string(&SetHealthRequest { status })
            .map_err(|e| ProxyApiError::BadResponse(e.to_string()))?;
        self.call_unit("POST", &format!("/api/hosts/{host}/health"), Some(&body))
            .await
    }

    pub async fn cert_renew(&self, host: &str) -> Result<(), ProxyApiError> {
        let body = serde_json::to_string(&CertRenewRequest {
            host: host.to_string(),
        })
        .map_err(|e| ProxyApiError::BadResponse(e.to_string()))?;
        self.call_unit("POST", "/api/cert/renew", Some(&body)).await
    }

    pub async fn status(&self) -> Result<StatusResponse, ProxyApiError> {
        self.call("GET", "/api/status", None).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> Result<T, ProxyApiError> {
        let envelope: ApiResponse<T> = self.call_raw(method, path, body).await?;
        envelope.into_result().map_err(ProxyApiError::Rejected)
    }

    async fn call_unit(
        &self,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> Result<(), ProxyApiError> {
        let envelope: ApiResponse<serde_json::Value> = self.call_raw(method, path, body).await?;
        envelope.ok().map_err(ProxyApiError::Rejected)
    }

    async fn call_raw<T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> Result<ApiResponse<T>, ProxyApiError> {
        let url = format!("{ADMIN_BASE}{path}");
        let mut args: Vec<&str> = vec![
            "curl",
            "-sS",
            "--max-time",
            "10",
            "-X",
            method,
            "-H",
            "Content-Type: application/json",
        ];
        if let Some(body) = body {
            args.push("--data-binary");
            args.push(body);
        }
        args.push(&url);

        let docker = RemoteDocker::new(self.ssh);
        let output = docker.exec(PROXY_CONTAINER, &args).await?;
        if !output.success() {
            return Err(ProxyApiError::BadResponse(format!(
                "curl in proxy container exited {:?}: {}",
                output.code,
                output.stderr.trim()
            )));
        }

        serde_json::from_str(&output.stdout)
            .map_err(|e| ProxyApiError::BadResponse(format!("{e}: {}", output.stdout.trim())))
    }
}
