//! Local admin API.
//!
//! Bound to loopback inside the proxy container; the orchestrator is
//! the primary client. Handlers are thin: validate, mutate through the
//! state store, and answer only after the mutation is on disk.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use iop_common::api::{
    ApiResponse, CertRenewRequest, HealthStatus, RouteSummary, SetHealthRequest, StagingRequest,
    StatusResponse, UpsertHostRequest,
};

use crate::acme::AcmeController;
use crate::errors::{AdminError, ProxyError};
use crate::health::HealthMonitor;
use crate::state::{CertRecord, RouteRecord, StateStore};

#[derive(Clone)]
pub struct AdminState {
    pub store: StateStore,
    pub acme: Arc<AcmeController>,
    pub monitor: Arc<HealthMonitor>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/api/hosts", post(upsert_host).get(list_hosts))
        .route("/api/hosts/{host}", delete(remove_host))
        .route("/api/hosts/{host}/health", post(set_health))
        .route("/api/status", get(status))
        .route("/api/cert/renew", post(cert_renew))
        .route("/api/staging", post(set_staging))
        .with_state(state)
}

/// Serve the admin API until `shutdown` flips.
pub async fn serve(
    state: AdminState,
    addr: std::net::SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ProxyError::Listener {
            addr: addr.to_string(),
            source,
        })?;
    info!("[PROXY] admin api listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|source| ProxyError::Listener {
            addr: addr.to_string(),
            source,
        })
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::UnknownHost(_) => StatusCode::NOT_FOUND,
            AdminError::InvalidTarget { .. } | AdminError::InvalidHost(_) => {
                StatusCode::BAD_REQUEST
            }
            AdminError::HostCollision { .. } => StatusCode::CONFLICT,
            AdminError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ApiResponse::<()>::error(self.to_string()))).into_response()
    }
}

async fn upsert_host(
    State(state): State<AdminState>,
    Json(request): Json<UpsertHostRequest>,
) -> Result<Json<ApiResponse<RouteSummary>>, AdminError> {
    let host = validate_host(&request.host)?;
    validate_target(&request.target)?;

    // One route per host; a host may move targets within its project
    // but never silently change owners.
    let owner = state
        .store
        .read(|doc| doc.routes.get(&host).map(|r| r.project.clone()))
        .await;
    if let Some(owner) = owner {
        if owner != request.project {
            return Err(AdminError::HostCollision { host, owner });
        }
    }

    let summary = state
        .store
        .mutate(|doc| {
            let issuer = doc.issuer();
            let route = doc
                .routes
                .entry(host.clone())
                .and_modify(|route| {
                    route.target = request.target.clone();
                    route.health_path = request.health_path.clone();
                    route.ssl = request.ssl;
                    route.request_timeout_secs = request.request_timeout_secs;
                })
                .or_insert_with(|| RouteRecord {
                    target: request.target.clone(),
                    project: request.project.clone(),
                    health_path: request.health_path.clone(),
                    ssl: request.ssl,
                    health: HealthStatus::Unknown,
                    request_timeout_secs: request.request_timeout_secs,
                });
            if request.ssl {
                doc.certs
                    .entry(host.clone())
                    .or_insert_with(|| CertRecord::new(issuer));
            }
            route.summary(&host, doc.certs.get(&host))
        })
        .await?;

    if request.ssl {
        state.acme.ensure_host(&host).await;
    }

    info!(host, target = %request.target, "[PROXY] route upserted");
    Ok(Json(ApiResponse::success(summary)))
}

async fn remove_host(
    State(state): State<AdminState>,
    Path(host): Path<String>,
) -> Result<Json<ApiResponse<()>>, AdminError> {
    let host = host.to_ascii_lowercase();

    let existed = state
        .store
        .mutate(|doc| {
            doc.certs.remove(&host);
            doc.routes.remove(&host).is_some()
        })
        .await?;
    if !existed {
        return Err(AdminError::UnknownHost(host));
    }

    if let Err(e) = state.acme.remove_host(&host).await {
        // The route is gone either way; leftover files are re-deletable.
        tracing::warn!(host, "[CERT] cleanup incomplete: {e}");
    }
    state.monitor.forget(&host).await;

    info!(host, "[PROXY] route removed");
    Ok(Json(ApiResponse::success(())))
}

async fn set_health(
    State(state): State<AdminState>,
    Path(host): Path<String>,
    Json(request): Json<SetHealthRequest>,
) -> Result<Json<ApiResponse<()>>, AdminError> {
    let host = host.to_ascii_lowercase();
    let found = state
        .store
        .mutate(|doc| match doc.routes.get_mut(&host) {
            Some(route) => {
                route.health = request.status;
                true
            }
            None => false,
        })
        .await?;
    if !found {
        return Err(AdminError::UnknownHost(host));
    }
    info!(host, status = ?request.status, "[HEALTH] status set by operator");
    Ok(Json(ApiResponse::success(())))
}

async fn list_hosts(
    State(state): State<AdminState>,
) -> Json<ApiResponse<Vec<RouteSummary>>> {
    let routes = state
        .store
        .read(|doc| {
            doc.routes
                .iter()
                .map(|(host, route)| route.summary(host, doc.certs.get(host)))
                .collect()
        })
        .await;
    Json(ApiResponse::success(routes))
}

async fn status(State(state): State<AdminState>) -> Json<ApiResponse<StatusResponse>> {
    let response = state
        .store
        .read(|doc| StatusResponse {
            staging: doc.staging,
            routes: doc
                .routes
                .iter()
                .map(|(host, route)| route.summary(host, doc.certs.get(host)))
                .collect(),
        })
        .await;
    Json(ApiResponse::success(response))
}

async fn cert_renew(
    State(state): State<AdminState>,
    Json(request): Json<CertRenewRequest>,
) -> Result<Json<ApiResponse<()>>, AdminError> {
    let host = request.host.to_ascii_lowercase();
    let known = state
        .store
        .read(|doc| doc.routes.contains_key(&host))
        .await;
    if !known {
        return Err(AdminError::UnknownHost(host));
    }
    state
        .acme
        .force_renew(&host)
        .await
        .map_err(|e| AdminError::InvalidTarget {
            target: host.clone(),
            message: e.to_string(),
        })?;
    info!(host, "[CERT] renewal forced");
    Ok(Json(ApiResponse::success(())))
}

async fn set_staging(
    State(state): State<AdminState>,
    Json(request): Json<StagingRequest>,
) -> Result<Json<ApiResponse<()>>, AdminError> {
    let changed = state
        .store
        .mutate(|doc| {
            let changed = doc.staging != request.staging;
            doc.staging = request.staging;
            changed
        })
        .await?;

    if changed {
        info!(staging = request.staging, "[ACME] staging toggled, reissuing certificates");
        state.acme.apply_staging_change().await;
    }
    Ok(Json(ApiResponse::success(())))
}

fn validate_host(raw: &str) -> Result<String, AdminError> {
    let host = raw.trim().to_ascii_lowercase();
    let valid = !host.is_empty()
        && host.len() <= 253
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid {
        return Err(AdminError::InvalidHost(raw.to_string()));
    }
    Ok(host)
}

fn validate_target(target: &str) -> Result<(), AdminError> {
    let invalid = |message: &str| AdminError::InvalidTarget {
        target: target.to_string(),
        message: message.to_string(),
    };
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;
    if host.is_empty() {
        return Err(invalid("empty upstream host"));
    }
    port.parse::<u16>()
        .map_err(|_| invalid("port is not numeric"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_validation_lowercases_and_rejects_garbage() {
        assert_eq!(validate_host("Demo.Example").unwrap(), "demo.example");
        assert!(validate_host("").is_err());
        assert!(validate_host("has space.example").is_err());
        assert!(validate_host("slash/example").is_err());
    }

    #[test]
    fn target_validation_requires_numeric_port() {
        assert!(validate_target("demo-web:3000").is_ok());
        assert!(validate_target("demo-web").is_err());
        assert!(validate_target("demo-web:http").is_err());
        assert!(validate_target(":3000").is_err());
    }
}
