//! Durable proxy state.
//!
//! A single JSON document holds everything the proxy must remember
//! across restarts: the route table, certificate summaries, and the
//! global staging toggle. Certificate PEM material is deliberately kept
//! out of the document and lives in per-host files under `certs/`.

mod store;

pub use store::StateStore;

use chrono::{DateTime, Utc};
use iop_common::api::{CertState, CertSummary, HealthStatus, IssuerMode, RouteSummary};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bumped when the document layout changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

/// The state snapshot, exactly as serialized to `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyState {
    pub schema_version: u32,
    /// When set, certificates are requested from the Let's Encrypt
    /// staging directory.
    #[serde(default)]
    pub staging: bool,
    #[serde(default)]
    pub routes: BTreeMap<String, RouteRecord>,
    #[serde(default)]
    pub certs: BTreeMap<String, CertRecord>,
}

impl ProxyState {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            staging: false,
            routes: BTreeMap::new(),
            certs: BTreeMap::new(),
        }
    }

    /// Issuer mode implied by the current staging toggle.
    pub fn issuer(&self) -> IssuerMode {
        if self.staging {
            IssuerMode::Staging
        } else {
            IssuerMode::Production
        }
    }
}

/// One route, keyed by external host in the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRecord {
    /// Upstream target, `{project}-{service}:{port}`.
    pub target: String,
    pub project: String,
    pub health_path: String,
    pub ssl: bool,
    /// Last observed health. Restored on boot so a proxy restart does
    /// not blank out a serving route; the monitor re-probes immediately.
    #[serde(default = "unknown_health")]
    pub health: HealthStatus,
    /// Per-route reverse-proxy timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

fn unknown_health() -> HealthStatus {
    HealthStatus::Unknown
}

impl RouteRecord {
    pub fn summary(&self, host: &str, cert: Option<&CertRecord>) -> RouteSummary {
        RouteSummary {
            host: host.to_string(),
            target: self.target.clone(),
            project: self.project.clone(),
            health_path: self.health_path.clone(),
            ssl: self.ssl,
            health: self.health,
            cert: cert.map(CertRecord::summary),
        }
    }
}

/// Per-host certificate record. PEM material lives on disk next to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertRecord {
    pub state: CertState,
    pub issuer: IssuerMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl CertRecord {
    pub fn new(issuer: IssuerMode) -> Self {
        Self {
            state: CertState::None,
            issuer,
            not_before: None,
            not_after: None,
            attempts: 0,
            next_attempt: None,
            last_error: None,
        }
    }

    pub fn summary(&self) -> CertSummary {
        CertSummary {
            state: self.state,
            issuer: self.issuer,
            not_before: self.not_before,
            not_after: self.not_after,
            attempts: self.attempts,
            next_attempt: self.next_attempt,
            last_error: self.last_error.clone(),
        }
    }

    /// Whether the served certificate is due for renewal.
    pub fn renewal_due(&self, now: DateTime<Utc>) -> bool {
        match (self.state, self.not_after) {
            (CertState::Valid, Some(not_after)) => now + chrono::Duration::days(30) >= not_after,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_state_serializes_with_schema_version() {
        let json = serde_json::to_string(&ProxyState::empty()).unwrap();
        assert!(json.contains("\"schema_version\":1"));
        let back: ProxyState = serde_json::from_str(&json).unwrap();
        assert!(back.routes.is_empty());
        assert!(!back.staging);
    }

    #[test]
    fn renewal_window_is_thirty_days() {
        let now = Utc::now();
        let mut record = CertRecord::new(IssuerMode::Production);
        record.state = CertState::Valid;

        record.not_after = Some(now + chrono::Duration::days(29));
        assert!(record.renewal_due(now));

        record.not_after = Some(now + chrono::Duration::days(31));
        assert!(!record.renewal_due(now));
    }

    #[test]
    fn route_health_defaults_to_unknown() {
        let record: RouteRecord = serde_json::from_str(
            r#"{"target":"demo-web:3000","project":"demo","health_path":"/up","ssl":true}"#,
        )
        .unwrap();
        assert_eq!(record.health, HealthStatus::Unknown);
    }
}
