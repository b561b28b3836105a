//! Admin API wire types.
//!
//! The proxy serves these on `127.0.0.1:8080` inside its container; the
//! orchestrator is the primary client. Bodies are JSON and every
//! response is wrapped in [`ApiResponse`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Latest probe verdict for a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// No probe has completed yet. Treated as not-serving.
    Unknown,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Certificate lifecycle state, per host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertState {
    None,
    Acquiring,
    Valid,
    Renewing,
    Failed,
}

/// Which ACME directory issued (or will issue) a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssuerMode {
    Staging,
    Production,
}

/// Body of `POST /api/hosts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertHostRequest {
    /// External FQDN; stored lowercased.
    pub host: String,
    /// Upstream target, `{project}-{service}:{port}`.
    pub target: String,
    pub project: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_ssl")]
    pub ssl: bool,
    /// Per-route reverse-proxy timeout; the proxy default applies when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

fn default_health_path() -> String {
    "/up".to_string()
}

fn default_ssl() -> bool {
    true
}

/// Body of `POST /api/hosts/{host}/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetHealthRequest {
    pub status: HealthStatus,
}

/// Body of `POST /api/cert/renew`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertRenewRequest {
    pub host: String,
}

/// Body of `POST /api/staging`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingRequest {
    pub staging: bool,
}

/// Certificate record as reported by the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertSummary {
    pub state: CertState,
    pub issuer: IssuerMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// One route as reported by `GET /api/hosts` and `GET /api/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSummary {
    pub host: String,
    pub target: String,
    pub project: String,
    pub health_path: String,
    pub ssl: bool,
    pub health: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<CertSummary>,
}

/// Body of `GET /api/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub staging: bool,
    pub routes: Vec<RouteSummary>,
}

/// Standard response wrapper used by every admin endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            timestamp: Utc::now(),
        }
    }

    /// Unwrap the payload, turning an error envelope into `Err`.
    pub fn into_result(self) -> Result<T, String> {
        if self.success {
            self.data
                .ok_or_else(|| "response missing data".to_string())
        } else {
            Err(self.error.unwrap_or_else(|| "unknown error".to_string()))
        }
    }

    /// Check success only, discarding any payload. Unit responses
    /// serialize their data as `null`, which `into_result` cannot
    /// distinguish from a missing payload; this can.
    pub fn ok(self) -> Result<(), String> {
        if self.success {
            Ok(())
        } else {
            Err(self.error.unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_defaults_apply() {
        let req: UpsertHostRequest = serde_json::from_str(
            r#"{"host":"demo.example","target":"demo-web:3000","project":"demo"}"#,
        )
        .unwrap();
        assert_eq!(req.health_path, "/up");
        assert!(req.ssl);
    }

    #[test]
    fn envelope_round_trips() {
        let ok = ApiResponse::success(StatusResponse {
            staging: true,
            routes: vec![],
        });
        let json = serde_json::to_string(&ok).unwrap();
        let back: ApiResponse<StatusResponse> = serde_json::from_str(&json).unwrap();
        assert!(back.into_result().unwrap().staging);

        let err: ApiResponse<StatusResponse> = ApiResponse::error("host collision");
        assert_eq!(err.into_result().unwrap_err(), "host collision");
    }

    #[test]
    fn health_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
        assert_eq!(serde_json::to_string(&CertState::Acquiring).unwrap(), "\"acquiring\"");
    }
}
